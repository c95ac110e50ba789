use owo_colors::OwoColorize as _;

fn main() {
  if let Err(err) = console_broker::run() {
    anstream::eprintln!("{}", format!("{err:#}").red());
    std::process::exit(1);
  }
}

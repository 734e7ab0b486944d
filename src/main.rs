use clap::Parser;
use telepresence::Exit;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    const BOLD_RED: &str = "\x1b[1;31m";
    const BOLD: &str = "\x1b[1m";
    const RESET: &str = "\x1b[0m";

    let cli = telepresence::cli::Cli::parse();
    let code = match cli.run() {
        Ok(Exit::Shell(code)) => code,
        Ok(Exit::ProxyLost(helper)) => {
            eprintln!(
                "{BOLD_RED}error{RESET}{BOLD}:{RESET} proxy to the cluster was lost ({helper} exited)"
            );
            3
        }
        Err(error) => {
            eprintln!("{BOLD_RED}error{RESET}{BOLD}:{RESET} {error}");
            if error.is_unexpected() {
                cli.crash_report();
            }
            1
        }
    };
    std::process::exit(code);
}

use anyhow::Result;
use clap::Parser;
use prewarm_core::config::{self, Cli, Commands};
use prewarm_core::registry::{Invocation, Registry};
use prewarm_core::supervisor;

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("[prewarm] Error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Supervise { notify_fd } => supervisor::run_supervisor(notify_fd),
        Commands::Kitten { name, args } => {
            let options = config::reload_from_env()?;
            let registry = Registry::prewarmed();
            let mut argv = vec![name];
            argv.extend(args);
            let stdin = std::io::stdin();
            let mut input = stdin.lock();
            let stdout = std::io::stdout();
            let mut output = stdout.lock();
            let mut invocation = Invocation {
                argv: &argv,
                stdin: &mut input,
                stdout: &mut output,
                options: &options,
            };
            registry.dispatch(&mut invocation)
        }
    }
}

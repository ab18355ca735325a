use clap::Parser;
use twt_cli::cmd::GlobalArgs;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let app = GlobalArgs::parse();
    // The runtime is gone once `run` returns, and with it every child process.
    let code = run(app);
    std::process::exit(code);
}

#[tokio::main]
async fn run(app: GlobalArgs) -> i32 {
    match app.exec_subcmd().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            1
        }
    }
}

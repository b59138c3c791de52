use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use judgebox::config::CliArgs;
use judgebox::context::JudgeContext;
use judgebox::error::JudgeError;
use judgebox::solutions::run_solutions;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            if let Some(diagnostics) = e
                .downcast_ref::<JudgeError>()
                .and_then(JudgeError::diagnostics)
            {
                eprintln!("{diagnostics}");
            }
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: CliArgs) -> anyhow::Result<bool> {
    let verification = cli.verification_level()?;
    let environment = cli.load_environment()?;
    let mut ctx = JudgeContext::open(&cli.package, environment)?.with_verification(verification);
    if let Some(threads) = cli.threads {
        if threads == 0 {
            anyhow::bail!("the number of worker threads must not be 0");
        }
        ctx = ctx.with_slots(threads);
    }
    if let Some(temp_dir) = &cli.temp_dir {
        ctx = ctx.with_temp_dir(temp_dir);
    }
    let n_workers = ctx.slots.size();
    let ctx = Arc::new(ctx);

    let token = CancellationToken::new();
    let pipeline = run_solutions(ctx, cli.tracked_solutions(), n_workers, token.clone());
    tokio::pin!(pipeline);

    let report = tokio::select! {
        report = &mut pipeline => report?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
            token.cancel();
            // Let workers drop their sandboxes before exiting
            if let Err(e) = pipeline.await {
                log::warn!("Pipeline stopped after cancellation: {e:#}");
            }
            return Ok(false);
        }
    };

    print!("{report}");
    Ok(report.passed())
}

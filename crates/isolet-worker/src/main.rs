use std::process;
use std::sync::Arc;

use isolet::WorkerArgs;
use isolet_worker::NativeHost;

fn main() -> anyhow::Result<()> {
    isolet::init_tracing();

    let argv: Vec<String> = std::env::args().collect();
    let args = match WorkerArgs::parse(&argv) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: isolet-worker [options] [-- <exec args>...]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --max-young-generation-size-mb <mb>  [default: 100]");
            eprintln!("  --max-old-generation-size-mb <mb>    [default: 100]");
            eprintln!("  --stack-size-mb <mb>                 [default: 40]");
            eprintln!("  --code-range-size-mb <mb>            [default: 100]");
            eprintln!("  --serialization <lengthDelimited|lines>");
            eprintln!();
            eprintln!("Stdin and stdout carry the control channel; do not run this by hand.");
            process::exit(2);
        }
    };

    tracing::info!(pid = process::id(), framing = args.framing.as_str(), "Worker starting");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let host = Arc::new(NativeHost::new(args.exec_args.clone()));
    runtime.block_on(isolet::run_worker(host, args))?;
    tracing::info!("Control channel closed, worker exiting");
    Ok(())
}

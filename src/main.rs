//! Speedmeter - main CLI application

use clap::Parser;
use colored::Colorize;
use speedmeter::{
    cli::Cli,
    error::Result,
    logging::Logger,
    models::result::TestResult,
    orchestrator::SpeedTest,
    types::SpeedScale,
    PKG_NAME, VERSION,
};
use std::process;

#[tokio::main]
async fn main() {
    // Pick up SPM_* variables from a local .env before clap reads them
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let use_color = cli.use_colors();

    if let Err(e) = run_application(cli).await {
        eprintln!("{}", e.format_for_console(use_color));
        process::exit(e.exit_code());
    }
}

/// Main application logic
async fn run_application(cli: Cli) -> Result<()> {
    cli.validate()?;

    let use_color = cli.use_colors();
    let json = cli.json;
    let debug = cli.debug;
    let logger = Logger::from_flags(cli.verbose, cli.debug, use_color);

    let config = cli.into_config()?;
    let scale = config.speed_scale();

    if debug {
        println!("{} v{}", PKG_NAME, VERSION);
        println!("Configuration loaded successfully:");
        println!("  Download URL: {}", config.download_url.as_deref().unwrap_or("-"));
        println!("  Upload URL: {}", config.upload_url.as_deref().unwrap_or("-"));
        println!("  Ping URL: {}", config.ping_url.as_deref().unwrap_or("-"));
        println!(
            "  Order: {:?}  Streams: {}/{}  Probes: {}",
            config.test_order, config.streams_dl, config.streams_ul, config.count_ping
        );
        println!(
            "  Budgets: dl {}s, ul {}s, ping {}s  Units: {}",
            config.time_dl_max_secs,
            config.time_ul_max_secs,
            config.time_ping_max_secs,
            scale.label()
        );
        println!();
    }

    let has_ip_lookup = config.ip_lookup_url.is_some();
    let mut test = SpeedTest::new(config)?.with_logger(logger);

    // Best-effort: a failed lookup never blocks the measurement
    if has_ip_lookup && !json {
        match test.lookup_ip().await {
            Ok(ip) => println!("Testing from {}", ip),
            Err(e) => eprintln!("IP lookup failed: {}", e),
        }
    }

    // Live progress goes to stderr so stdout stays clean for results
    if !json {
        let label = scale.label();
        test = test.on_update(move |snapshot| {
            let line = format!(
                "[{:>8}] ping {} ms | jitter {} ms | down {} {} | up {} {}",
                snapshot.phase.name(),
                snapshot.ping,
                snapshot.jitter,
                snapshot.download,
                label,
                snapshot.upload,
                label,
            );
            eprint!("\r{:<90}", line);
        });
    }

    // Ctrl-C aborts the run; the engine reports it through the result
    let aborter = test.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            aborter.abort();
        }
    });

    let result = test.start().await;
    if !json {
        eprintln!();
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result, scale, use_color);
    }

    Ok(())
}

/// Render the final result for terminal consumption
fn print_result(result: &TestResult, scale: SpeedScale, use_color: bool) {
    let heading = if result.aborted {
        "Speed test aborted (partial results)"
    } else {
        "Speed test results"
    };
    if use_color {
        println!("{}", heading.bold());
    } else {
        println!("{}", heading);
    }

    let rows = [
        ("Ping", format!("{} ms", result.ping)),
        ("Jitter", format!("{} ms", result.jitter)),
        ("Download", format!("{} {}", result.download, scale.label())),
        ("Upload", format!("{} {}", result.upload, scale.label())),
    ];
    for (name, value) in rows {
        if use_color {
            println!("  {:<10} {}", format!("{}:", name), value.green());
        } else {
            println!("  {:<10} {}", format!("{}:", name), value);
        }
    }
    println!(
        "  {:<10} {} down / {} up, {} ping samples",
        "Bytes:", result.download_bytes, result.upload_bytes, result.ping_samples
    );
}

mod client;
mod serve;

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use crate::core::config::Config;
use crate::core::cron::CronSchedule;
use crate::core::terminal::{self, GuideSection, print_error};
use crate::platform::{NativePlatform, Platform};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Server")
        .command("serve", "Run the orchestrator, cron scheduler and API")
        .print();

    GuideSection::new("Jobs")
        .command("submit", "Submit a job: submit <prompt> [--source s]")
        .command("jobs", "List jobs [--page n] [--status s]")
        .command("job", "Show one job: job <id>")
        .command("counts", "Job counts per status")
        .command("cancel", "Cancel a running job: cancel <id>")
        .command("retry", "Resubmit a job: retry <id>")
        .command("refresh", "Poll the remote run of a job: refresh <id>")
        .command("pool", "Warm pool status")
        .command("watch", "Follow live events [--types a,b]")
        .print();

    GuideSection::new("Cron")
        .command("crons", "List cron entries")
        .command("cron-run", "Fire a cron entry now: cron-run <name>")
        .command("validate-cron", "Check a schedule: validate-cron \"0 9 * * 1\"")
        .print();

    println!(
        "\n {} {} <command> [--api-host h] [--api-port p]\n",
        style("Usage:").bold(),
        style("jobrelay").green()
    );
}

pub(crate) fn parse_api_server_flags(
    args: &[String],
    start: usize,
    mut api_host: String,
    mut api_port: u16,
) -> (String, u16) {
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--api-port" => {
                if i + 1 < args.len() {
                    api_port = args[i + 1].parse().unwrap_or(api_port);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    api_host = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    (api_host, api_port)
}

fn validate_cron_command(args: &[String]) {
    let expression = args[2..].join(" ");
    if expression.trim().is_empty() {
        print_error("Usage: jobrelay validate-cron \"<minute> <hour> <day> <month> <weekday>\"");
        return;
    }
    match CronSchedule::parse(&expression) {
        Ok(schedule) => {
            terminal::print_success(&format!("Valid schedule: {}", schedule.describe()));
            if let Some(next) = schedule.next_after(chrono::Utc::now(), &chrono::Utc) {
                terminal::print_status("Next run (UTC)", &next.to_rfc3339());
            }
        }
        Err(e) => print_error(&format!("Invalid schedule: {}", e)),
    }
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let data_dir: PathBuf = NativePlatform::data_dir();

    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };

    match cmd {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "validate-cron" => {
            validate_cron_command(&args);
            Ok(())
        }
        _ => {
            let mut config = Config::load(&data_dir).await?;
            let (api_host, api_port) =
                parse_api_server_flags(&args, 2, config.server.host.clone(), config.server.port);
            config.server.host = api_host;
            config.server.port = api_port;
            let api_url = format!("http://{}:{}", config.server.host, config.server.port);

            match cmd {
                "serve" => serve::run_serve(data_dir, config).await,
                "watch" => client::watch_events(&args, &api_url).await,
                "submit" | "jobs" | "job" | "counts" | "cancel" | "retry" | "refresh" | "pool"
                | "crons" | "cron-run" => client::run_client_command(&args, &api_url).await,
                other => {
                    print_error(&format!("Unknown command '{}'", other));
                    print_help();
                    Ok(())
                }
            }
        }
    }
}

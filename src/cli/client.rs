use anyhow::{Result, anyhow};
use console::style;
use reqwest::Client;
use tokio_stream::StreamExt;

use crate::core::terminal::{self, GuideSection, print_error, print_success};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestPlan {
    method: HttpMethod,
    path: String,
    body: Option<serde_json::Value>,
}

impl RequestPlan {
    fn get(path: String) -> Self {
        Self {
            method: HttpMethod::Get,
            path,
            body: None,
        }
    }

    fn post(path: String, body: Option<serde_json::Value>) -> Self {
        Self {
            method: HttpMethod::Post,
            path,
            body,
        }
    }
}

/// Flags that take a value; everything else after the command is positional.
const VALUE_FLAGS: &[&str] = &[
    "--api-host",
    "--api-port",
    "--source",
    "--chat-id",
    "--external-id",
    "--page",
    "--status",
    "--types",
];

fn parse_string_flag(args: &[String], flag: &str) -> Option<String> {
    let mut i = 2;
    while i < args.len() {
        if args[i] == flag {
            return args.get(i + 1).cloned();
        }
        i += 1;
    }
    None
}

fn parse_positional_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut i = 2;
    while i < args.len() {
        if VALUE_FLAGS.contains(&args[i].as_str()) {
            i += 2;
        } else {
            out.push(args[i].clone());
            i += 1;
        }
    }
    out
}

fn required_id(args: &[String], command: &str) -> Result<String> {
    parse_positional_args(args)
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Usage: jobrelay {} <job_id>", command))
}

fn build_request_plan(args: &[String]) -> Result<RequestPlan> {
    let command = args.get(1).map(String::as_str).unwrap_or_default();
    match command {
        "submit" => {
            let prompt = parse_positional_args(args).join(" ");
            if prompt.trim().is_empty() {
                return Err(anyhow!("Usage: jobrelay submit <prompt> [--source chat|cron|trigger|api]"));
            }
            let mut body = serde_json::json!({ "prompt": prompt });
            for (flag, key) in [
                ("--source", "source"),
                ("--chat-id", "chat_id"),
                ("--external-id", "external_id"),
            ] {
                if let Some(value) = parse_string_flag(args, flag) {
                    body[key] = serde_json::Value::String(value);
                }
            }
            Ok(RequestPlan::post("/api/jobs".to_string(), Some(body)))
        }
        "jobs" => {
            let mut query = Vec::new();
            if let Some(page) = parse_string_flag(args, "--page") {
                let page: usize = page
                    .parse()
                    .map_err(|_| anyhow!("--page must be a positive number"))?;
                query.push(format!("page={}", page));
            }
            if let Some(status) = parse_string_flag(args, "--status") {
                query.push(format!("status={}", status));
            }
            let path = if query.is_empty() {
                "/api/jobs".to_string()
            } else {
                format!("/api/jobs?{}", query.join("&"))
            };
            Ok(RequestPlan::get(path))
        }
        "job" => Ok(RequestPlan::get(format!(
            "/api/jobs/{}",
            required_id(args, "job")?
        ))),
        "counts" => Ok(RequestPlan::get("/api/jobs/counts".to_string())),
        "cancel" | "retry" | "refresh" => Ok(RequestPlan::post(
            format!("/api/jobs/{}/{}", required_id(args, command)?, command),
            None,
        )),
        "pool" => Ok(RequestPlan::get("/api/pool".to_string())),
        "crons" => Ok(RequestPlan::get("/api/crons".to_string())),
        "cron-run" => {
            let name = parse_positional_args(args)
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("Usage: jobrelay cron-run <name>"))?;
            Ok(RequestPlan::post(format!("/api/crons/{}/run", name), None))
        }
        other => Err(anyhow!("Unknown command '{}'", other)),
    }
}

/// Send one API request built from the command line and print the reply.
pub async fn run_client_command(args: &[String], api_url: &str) -> Result<()> {
    let plan = build_request_plan(args)?;
    let client = Client::new();
    let url = format!("{}{}", api_url.trim_end_matches('/'), plan.path);

    let request = match plan.method {
        HttpMethod::Get => client.get(&url),
        HttpMethod::Post => client.post(&url),
    };
    let request = if let Some(body) = &plan.body {
        request.json(body)
    } else {
        request
    };

    let resp = request
        .send()
        .await
        .map_err(|e| anyhow!("Cannot reach jobrelay at {}: {}", api_url, e))?;
    let status = resp.status();
    let body = resp.json::<serde_json::Value>().await?;
    let ok = body
        .get("success")
        .and_then(|v| v.as_bool())
        .unwrap_or(status.is_success());

    if !ok {
        let message = body
            .get("error")
            .or_else(|| body.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("request failed");
        print_error(message);
        return Ok(());
    }

    match args.get(1).map(String::as_str) {
        Some("submit") | Some("retry") => {
            let id = body.get("job_id").and_then(|v| v.as_str()).unwrap_or("?");
            print_success(&format!("Job {} submitted", id));
        }
        Some("cancel") => print_success("Job cancelled"),
        Some("jobs") => print_job_table(&body),
        _ => {
            GuideSection::new("Response")
                .text(&serde_json::to_string_pretty(&body)?)
                .print();
            println!();
        }
    }
    Ok(())
}

fn print_job_table(body: &serde_json::Value) {
    let jobs = body
        .get("jobs")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if jobs.is_empty() {
        terminal::print_info("No jobs on this page.");
        return;
    }
    for job in &jobs {
        let field = |key: &str| job.get(key).and_then(|v| v.as_str()).unwrap_or("-");
        let detail = job
            .get("summary")
            .or_else(|| job.get("error"))
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| field("prompt"));
        println!(
            "  {}  {:<9}  {:<7}  {}",
            style(field("id")).dim(),
            terminal::styled_status(field("status")),
            field("source"),
            detail
        );
    }
}

/// Follow `/api/events` and print each event as it arrives.
pub async fn watch_events(args: &[String], api_url: &str) -> Result<()> {
    let mut url = format!("{}/api/events", api_url.trim_end_matches('/'));
    if let Some(types) = parse_string_flag(args, "--types") {
        url = format!("{}?types={}", url, types);
    }
    let resp = Client::new().get(&url).send().await?;
    if !resp.status().is_success() {
        return Err(anyhow!("request failed with status {}", resp.status()));
    }

    terminal::print_info("Watching events (Ctrl+C to stop)");
    let mut stream = resp.bytes_stream();
    let mut event_name = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for line in String::from_utf8_lossy(&chunk).lines() {
            if let Some(name) = line.strip_prefix("event:") {
                event_name = name.trim().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                println!("{} {}", style(&event_name).bold().cyan(), data.trim());
            }
        }
    }
    Ok(())
}

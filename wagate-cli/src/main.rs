//! wagate-cli: admin frontend for the wagate gateway
//!
//! Talks to the `/health` and `/admin/users` routes of a running server.
//!
//! # Subcommands
//! - `status`                                          show server health
//! - `users list [--json]`                             list tenants
//! - `users add <name> <token> [--webhook] [--events] [--expiration]`
//! - `users remove <id>`                               stop and delete a tenant

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

const DEFAULT_SERVER: &str = "http://127.0.0.1:9000";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "wagate-cli", version, about = "wagate gateway admin CLI")]
struct Cli {
    /// Gateway HTTP URL (overrides WAGATE_HTTP_URL env var)
    #[arg(long, env = "WAGATE_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Admin token sent as the Authorization header
    #[arg(long, env = "WAGATE_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show gateway status
    Status,

    /// Manage tenants
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
}

#[derive(Debug, Subcommand)]
enum UsersCommand {
    /// List every tenant
    List {
        /// Print the raw JSON array
        #[arg(long)]
        json: bool,
    },

    /// Create a tenant
    Add {
        name: String,
        token: String,

        #[arg(long, default_value = "")]
        webhook: String,

        /// Comma-separated event tags, e.g. Message,ReadReceipt
        #[arg(long, default_value = "")]
        events: String,

        /// Unix seconds after which the tenant is no longer reconnected
        #[arg(long)]
        expiration: Option<i64>,
    },

    /// Stop and delete a tenant
    Remove { id: i64 },
}

// ============================================================================
// API Types
// ============================================================================

/// One tenant as returned by the admin API
#[derive(Debug, Deserialize)]
pub struct TenantView {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub webhook: String,
    #[serde(default)]
    pub jid: String,
    #[serde(default)]
    pub connected: bool,
    pub expiration: Option<i64>,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct NewTenantBody {
    pub name: String,
    pub token: String,
    pub webhook: String,
    pub events: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<i64>,
}

/// Split a comma-separated event list, dropping blanks.
pub fn parse_events(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// One line per tenant for the human-readable listing.
pub fn format_tenant_row(t: &TenantView) -> String {
    let state = if t.connected { "connected" } else { "offline" };
    let jid = if t.jid.is_empty() { "-" } else { &t.jid };
    let events = if t.events.is_empty() {
        "-".to_string()
    } else {
        t.events.join(",")
    };
    format!("{:>5}  {:<20}  {:<9}  {:<28}  {}", t.id, t.name, state, jid, events)
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client() -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?)
}

fn admin_token(token: Option<&str>) -> anyhow::Result<&str> {
    match token {
        Some(t) if !t.is_empty() => Ok(t),
        _ => anyhow::bail!("admin token required (--admin-token or WAGATE_ADMIN_TOKEN)"),
    }
}

/// Exit with the server's error message unless the response is 2xx.
fn ensure_success(
    url: &str,
    resp: reqwest::Result<reqwest::blocking::Response>,
) -> reqwest::blocking::Response {
    let resp = match resp {
        Ok(r) => r,
        Err(e) => {
            eprintln!("wagate-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };
    if !resp.status().is_success() {
        let status = resp.status();
        let body: serde_json::Value = resp.json().unwrap_or_default();
        let message = body["error"].as_str().unwrap_or("no details");
        eprintln!("wagate-cli: server returned {}: {}", status, message);
        std::process::exit(1);
    }
    resp
}

fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = client()?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Wagate server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:       {}", body["version"].as_str().unwrap_or("?"));
            println!("Store:         {}", body["store"].as_str().unwrap_or("?"));
            println!("Sessions:      {}", body["sessions"].as_u64().unwrap_or(0));
            println!("Recoveries:    {}", body["recoveries"].as_u64().unwrap_or(0));
        }
        Ok(r) => {
            eprintln!("wagate-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("wagate-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }
    Ok(())
}

fn do_list(server: &str, token: &str, json: bool) -> anyhow::Result<()> {
    let url = format!("{}/admin/users", server);
    let resp = ensure_success(&url, client()?.get(&url).header("Authorization", token).send());

    if json {
        let raw: serde_json::Value = resp.json()?;
        println!("{}", serde_json::to_string_pretty(&raw)?);
        return Ok(());
    }

    let tenants: Vec<TenantView> = resp.json()?;
    if tenants.is_empty() {
        eprintln!("No tenants");
        return Ok(());
    }
    for t in &tenants {
        println!("{}", format_tenant_row(t));
    }
    Ok(())
}

fn do_add(server: &str, token: &str, body: NewTenantBody) -> anyhow::Result<()> {
    let url = format!("{}/admin/users", server);
    let resp = ensure_success(
        &url,
        client()?
            .post(&url)
            .header("Authorization", token)
            .json(&body)
            .send(),
    );
    let created: TenantView = resp.json()?;
    println!("Created tenant {} ({})", created.id, created.name);
    Ok(())
}

fn do_remove(server: &str, token: &str, id: i64) -> anyhow::Result<()> {
    let url = format!("{}/admin/users/{}", server, id);
    ensure_success(&url, client()?.delete(&url).header("Authorization", token).send());
    println!("Removed tenant {}", id);
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn run(cli: Cli) -> anyhow::Result<()> {
    let server = cli.server.trim_end_matches('/').to_string();
    match cli.command {
        Commands::Status => do_status(&server),
        Commands::Users { command } => {
            let token = admin_token(cli.admin_token.as_deref())?;
            match command {
                UsersCommand::List { json } => do_list(&server, token, json),
                UsersCommand::Add {
                    name,
                    token: tenant_token,
                    webhook,
                    events,
                    expiration,
                } => do_add(
                    &server,
                    token,
                    NewTenantBody {
                        name,
                        token: tenant_token,
                        webhook,
                        events: parse_events(&events),
                        expiration,
                    },
                ),
                UsersCommand::Remove { id } => do_remove(&server, token, id),
            }
        }
    }
}

fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("wagate-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunneld Contributors

// Tunneld - CLI Client
// tunnelctl: command-line access to the daemon's control API

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Cell, ContentArrangement, Table};
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};

use config::CliConfig;
use tunneld_common::{AuthMethod, HostKeyMode, TunnelType};

#[derive(Parser)]
#[command(name = "tunnelctl")]
#[command(about = "Manage tunneld SSH tunnels", long_about = None)]
#[command(version)]
struct Cli {
    /// Daemon base URL (overrides the config file)
    #[arg(long, global = true)]
    daemon_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a tunnel
    Create {
        /// Tunnel name (unique)
        name: String,

        /// Tunnel type: local, remote, or dynamic
        #[arg(short = 't', long, default_value = "local")]
        tunnel_type: String,

        /// Hop as user@host[:port]; repeat for multi-hop chains
        #[arg(short = 'H', long = "hop", required = true)]
        hops: Vec<String>,

        /// Authentication method: key, password, agent, or cert
        #[arg(short = 'a', long, default_value = "agent")]
        auth: String,

        /// Private key (or certificate) path for key/cert auth
        #[arg(short = 'k', long)]
        key: Option<String>,

        /// Host-key policy: strict, known-hosts, or insecure
        #[arg(long, default_value = "known-hosts")]
        host_key: String,

        /// Local port to bind (0 = ephemeral)
        #[arg(short = 'l', long, default_value = "0")]
        local_port: u16,

        /// Local bind address
        #[arg(short = 'b', long)]
        bind_address: Option<String>,

        /// Remote host to forward to (local type)
        #[arg(short = 'r', long)]
        remote_host: Option<String>,

        /// Remote port (target port for local type, bound port for remote type)
        #[arg(short = 'p', long)]
        remote_port: Option<u16>,

        /// Reconnect automatically when the session drops
        #[arg(long)]
        auto_reconnect: bool,

        /// Keep-alive interval in seconds
        #[arg(long)]
        keep_alive: Option<u64>,

        /// Maximum connect retries
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// List tunnels
    List {
        /// Output raw JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Show one tunnel
    Get { id: String },

    /// Show a tunnel's live status
    Status { id: String },

    /// Show a tunnel's traffic metrics
    Metrics { id: String },

    /// Start a stopped tunnel
    Start { id: String },

    /// Stop a tunnel (keeps its spec)
    Stop { id: String },

    /// Delete a tunnel
    Delete { id: String },

    /// Daemon health summary
    Health,

    /// Stream tunnel status events
    Watch,

    /// Log in and store a token
    Login {
        username: String,
        /// Password (prompted from stdin when omitted)
        #[arg(long)]
        password: Option<String>,
    },
}

struct ApiClient {
    base_url: String,
    token: Option<String>,
    http: Client,
}

impl ApiClient {
    fn new(config: &CliConfig, override_url: Option<String>) -> Self {
        Self {
            base_url: override_url.unwrap_or_else(|| config.daemon_url.clone()),
            token: config.token.clone(),
            http: Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .with_context(|| format!("request to {} failed; is the daemon running?", self.base_url))?;
        check_response(response).await
    }

    async fn post_json(&self, path: &str, body: Option<Value>) -> Result<Value> {
        let mut builder = self.request(reqwest::Method::POST, path);
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let response = builder
            .send()
            .await
            .with_context(|| format!("request to {} failed; is the daemon running?", self.base_url))?;
        check_response(response).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, path)
            .send()
            .await
            .with_context(|| format!("request to {} failed; is the daemon running?", self.base_url))?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }
        check_response(response).await.map(|_| ())
    }
}

/// Surface the daemon's error envelope as a readable failure
async fn check_response(response: Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(body);
    }

    let code = body["code"].as_str().unwrap_or("UNKNOWN");
    let message = body["message"].as_str().unwrap_or("no message");
    if let Some(details) = body["details"].as_array() {
        let fields: Vec<String> = details
            .iter()
            .map(|d| {
                format!(
                    "  {}: {}",
                    d["field"].as_str().unwrap_or("?"),
                    d["issue"].as_str().unwrap_or("?")
                )
            })
            .collect();
        bail!("{} ({}):\n{}", message, code, fields.join("\n"));
    }
    bail!("{} ({})", message, code);
}

/// Parse user@host[:port] into its parts
fn parse_hop(raw: &str) -> Result<(String, String, u16)> {
    let (user, rest) = raw
        .split_once('@')
        .ok_or_else(|| anyhow::anyhow!("hop '{}' must be user@host[:port]", raw))?;
    if user.is_empty() {
        bail!("hop '{}' has an empty user", raw);
    }

    let (host, port) = match tunneld_common::split_host_port(rest) {
        Some((host, port)) => (host, port),
        None => (rest.to_string(), 22),
    };
    if host.is_empty() {
        bail!("hop '{}' has an empty host", raw);
    }
    Ok((user.to_string(), host, port))
}

fn parse_enum<T: serde::de::DeserializeOwned>(kind: &str, raw: &str) -> Result<T> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|_| anyhow::anyhow!("invalid {}: '{}'", kind, raw))
}

fn state_cell(state: &str) -> Cell {
    let colored = match state {
        "active" => state.green(),
        "failed" => state.red(),
        "pending" => state.yellow(),
        _ => state.normal(),
    };
    Cell::new(colored.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load()?;
    let client = ApiClient::new(&config, cli.daemon_url.clone());

    match cli.command {
        Commands::Create {
            name,
            tunnel_type,
            hops,
            auth,
            key,
            host_key,
            local_port,
            bind_address,
            remote_host,
            remote_port,
            auto_reconnect,
            keep_alive,
            max_retries,
        } => {
            let tunnel_type: TunnelType = parse_enum("tunnel type", &tunnel_type)?;
            let auth_method: AuthMethod = parse_enum("auth method", &auth)?;
            let host_key: HostKeyMode = parse_enum("host-key mode", &host_key)?;

            let hops: Vec<Value> = hops
                .iter()
                .map(|raw| {
                    let (user, host, port) = parse_hop(raw)?;
                    Ok(json!({
                        "host": host,
                        "port": port,
                        "user": user,
                        "auth_method": auth_method,
                        "key_id": key,
                        "host_key": host_key,
                    }))
                })
                .collect::<Result<_>>()?;

            let mut body = json!({
                "name": name,
                "type": tunnel_type,
                "hops": hops,
                "localPort": local_port,
                "autoReconnect": auto_reconnect,
            });
            if let Some(bind) = bind_address {
                body["localBindAddress"] = json!(bind);
            }
            if let Some(host) = remote_host {
                body["remoteHost"] = json!(host);
            }
            if let Some(port) = remote_port {
                body["remotePort"] = json!(port);
            }
            if let Some(secs) = keep_alive {
                body["keepAlive"] = json!(secs);
            }
            if let Some(retries) = max_retries {
                body["maxRetries"] = json!(retries);
            }

            let tunnel = client.post_json("/api/tunnels", Some(body)).await?;
            println!(
                "{} tunnel {} ({})",
                "created".green().bold(),
                tunnel["name"].as_str().unwrap_or("?"),
                tunnel["id"].as_str().unwrap_or("?")
            );
            println!("status: {}", tunnel["status"].as_str().unwrap_or("?"));
        }

        Commands::List { json } => {
            let tunnels = client.get_json("/api/tunnels").await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tunnels)?);
                return Ok(());
            }

            let empty = Vec::new();
            let list = tunnels.as_array().unwrap_or(&empty);
            if list.is_empty() {
                println!("no tunnels");
                return Ok(());
            }

            let mut table = Table::new();
            table
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ID", "NAME", "TYPE", "STATE", "LOCAL", "REMOTE", "OWNER"]);
            for t in list {
                let local = format!(
                    "{}:{}",
                    t["localBindAddress"].as_str().unwrap_or("127.0.0.1"),
                    t["localPort"].as_u64().unwrap_or(0)
                );
                let remote = match t["type"].as_str() {
                    Some("dynamic") => "(socks5)".to_string(),
                    _ => format!(
                        "{}:{}",
                        t["remoteHost"].as_str().unwrap_or(""),
                        t["remotePort"].as_u64().unwrap_or(0)
                    ),
                };
                table.add_row(vec![
                    Cell::new(t["id"].as_str().unwrap_or("?")),
                    Cell::new(t["name"].as_str().unwrap_or("?")),
                    Cell::new(t["type"].as_str().unwrap_or("?")),
                    state_cell(t["status"].as_str().unwrap_or("?")),
                    Cell::new(local),
                    Cell::new(remote),
                    Cell::new(t["owner"].as_str().unwrap_or("?")),
                ]);
            }
            println!("{table}");
        }

        Commands::Get { id } => {
            let tunnel = client.get_json(&format!("/api/tunnels/{}", id)).await?;
            println!("{}", serde_json::to_string_pretty(&tunnel)?);
        }

        Commands::Status { id } => {
            let status = client
                .get_json(&format!("/api/tunnels/{}/status", id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Metrics { id } => {
            let metrics = client
                .get_json(&format!("/api/tunnels/{}/metrics", id))
                .await?;
            println!(
                "bytes in:  {}\nbytes out: {}\nactive connections: {}\nuptime: {}s",
                metrics["bytesIn"].as_u64().unwrap_or(0),
                metrics["bytesOut"].as_u64().unwrap_or(0),
                metrics["connectionsActive"].as_u64().unwrap_or(0),
                metrics["uptime"].as_i64().unwrap_or(0),
            );
        }

        Commands::Start { id } => {
            let tunnel = client
                .post_json(&format!("/api/tunnels/{}/start", id), None)
                .await?;
            println!(
                "{} tunnel {}, status: {}",
                "starting".yellow(),
                id,
                tunnel["status"].as_str().unwrap_or("?")
            );
        }

        Commands::Stop { id } => {
            client
                .post_json(&format!("/api/tunnels/{}/stop", id), None)
                .await?;
            println!("{} tunnel {}", "stopped".normal(), id);
        }

        Commands::Delete { id } => {
            client.delete(&format!("/api/tunnels/{}", id)).await?;
            println!("{} tunnel {}", "deleted".red(), id);
        }

        Commands::Health => {
            let health = client.get_json("/api/health").await?;
            println!(
                "status: {}\nversion: {}\ntunnels: {} total, {} active, {} failed",
                health["status"].as_str().unwrap_or("?"),
                health["version"].as_str().unwrap_or("?"),
                health["tunnels"]["total"].as_u64().unwrap_or(0),
                health["tunnels"]["active"].as_u64().unwrap_or(0),
                health["tunnels"]["failed"].as_u64().unwrap_or(0),
            );
        }

        Commands::Watch => {
            watch_events(&client).await?;
        }

        Commands::Login { username, password } => {
            let password = match password {
                Some(p) => p,
                None => {
                    eprint!("password: ");
                    let mut line = String::new();
                    std::io::stdin().read_line(&mut line)?;
                    line.trim_end().to_string()
                }
            };

            let response = client
                .post_json(
                    "/api/auth/login",
                    Some(json!({ "username": username, "password": password })),
                )
                .await?;

            let token = response["token"]
                .as_str()
                .context("login response carried no token")?;
            config.token = Some(token.to_string());
            if let Some(url) = cli.daemon_url {
                config.daemon_url = url;
            }
            config.save()?;
            println!(
                "{}; token stored in {}",
                "logged in".green(),
                CliConfig::config_path()?.display()
            );
        }
    }

    Ok(())
}

/// Follow the daemon's SSE stream, printing tunnel updates as they arrive
async fn watch_events(client: &ApiClient) -> Result<()> {
    let response = client
        .request(reqwest::Method::GET, "/api/events")
        .send()
        .await
        .context("failed to open event stream")?;
    if !response.status().is_success() {
        bail!("event stream refused: {}", response.status());
    }

    println!("watching tunnel events (ctrl-c to stop)...");

    let mut buffer = String::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("event stream interrupted")?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        // SSE frames are newline-delimited "data: <json>" lines
        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim().to_string();
            buffer.drain(..=pos);

            let Some(payload) = line.strip_prefix("data: ") else {
                continue;
            };
            let Ok(event) = serde_json::from_str::<Value>(payload) else {
                continue;
            };

            match event["type"].as_str() {
                Some("tunnel_update") => {
                    let status = &event["status"];
                    let state = status["state"].as_str().unwrap_or("?");
                    let line = format!(
                        "{} {} -> {}{}",
                        chrono::Utc::now().format("%H:%M:%S"),
                        event["tunnelId"].as_str().unwrap_or("?"),
                        state,
                        status["lastError"]
                            .as_str()
                            .map(|e| format!(" ({})", e))
                            .unwrap_or_default()
                    );
                    match state {
                        "active" => println!("{}", line.green()),
                        "failed" => println!("{}", line.red()),
                        _ => println!("{}", line),
                    }
                }
                Some("heartbeat") => {}
                _ => {}
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hop_forms() {
        assert_eq!(
            parse_hop("deploy@bastion").unwrap(),
            ("deploy".into(), "bastion".into(), 22)
        );
        assert_eq!(
            parse_hop("root@10.0.0.1:2222").unwrap(),
            ("root".into(), "10.0.0.1".into(), 2222)
        );
        assert!(parse_hop("no-user-here").is_err());
        assert!(parse_hop("@host").is_err());
    }

    #[test]
    fn parse_enum_rejects_unknown_values() {
        assert!(parse_enum::<TunnelType>("tunnel type", "local").is_ok());
        assert!(parse_enum::<TunnelType>("tunnel type", "sideways").is_err());
        assert!(parse_enum::<AuthMethod>("auth method", "agent").is_ok());
        assert!(parse_enum::<HostKeyMode>("host-key mode", "known-hosts").is_ok());
        assert!(parse_enum::<HostKeyMode>("host-key mode", "yolo").is_err());
    }
}

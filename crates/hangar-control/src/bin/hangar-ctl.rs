// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hangar Control CLI
//!
//! Operator tool for the hangar control plane. Reads its configuration from
//! the `HANGAR_*` environment variables (a `.env` file is honoured).
//!
//! Usage:
//!   hangar-ctl <command> [options]

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use hangar_agent_sdk::{NodeProbe, QuicDialer};
use hangar_control::persistence::{self, WorkloadFilter};
use hangar_control::{Config, ControlPlane, RegisterNode};

fn print_usage() {
    eprintln!(
        r#"Usage: hangar-ctl <command> [options]

Operate the hangar control plane.

COMMANDS:
    migrate                         Apply database migrations
    probe <address> <token>         Check a daemon before registering it
    node-add                        Probe and register a node
    node-list                       List registered nodes
    node-stats <node_id>            Live statistics from a node
    node-maintenance <node_id> <on|off>
    node-delete <node_id>           Delete a node with no workloads
    user-add <username>             Create a user with the starting balance
    grant <user_id> <amount>        Credit a user's balance
    balance <user_id>               Show balances, pool and recent entries
    usage <user_id>                 Show resources used by a user's workloads
    workload-list                   List workloads
    workload-delete <workload_id>   Delete a workload (local state always wins)

NODE-ADD OPTIONS:
    --name <name>                   Node name (required)
    --host <host>                   Daemon host (required)
    --port <port>                   Daemon RPC port (required)
    --token <token>                 Daemon bearer token (required)
    --ram-mb <mb>                   Total RAM (default: reported by node)
    --disk-mb <mb>                  Total disk (default: reported by node)

GRANT OPTIONS:
    --source <source>               Ledger source (default: admin; purchase credits earned)
    --description <text>            Ledger description

WORKLOAD-LIST OPTIONS:
    --owner <user_id>               Filter by owner
    --node <node_id>                Filter by node

ENVIRONMENT:
    HANGAR_DATABASE_URL             postgres://... or sqlite:... (required)
    HANGAR_TLS_CERT / _KEY / _CA    Client certificate, key and daemon CA
    HANGAR_INSECURE_TRANSPORT       Skip TLS verification (development only)
    RUST_LOG                        Log filter (default: hangar_control=info)

EXAMPLES:
    hangar-ctl probe 10.1.0.4:8443 "$DAEMON_TOKEN"
    hangar-ctl node-add --name fra-1 --host 10.1.0.4 --port 8443 --token "$DAEMON_TOKEN"
    hangar-ctl grant 3f1c... 500 --source purchase --description "order #1182"
"#
    );
}

#[derive(Debug, PartialEq)]
enum Command {
    Migrate,
    Probe {
        address: String,
        token: String,
    },
    NodeAdd {
        name: String,
        host: String,
        port: u16,
        token: String,
        ram_mb: Option<i64>,
        disk_mb: Option<i64>,
    },
    NodeList,
    NodeStats {
        node_id: String,
    },
    NodeMaintenance {
        node_id: String,
        enabled: bool,
    },
    NodeDelete {
        node_id: String,
    },
    UserAdd {
        username: String,
    },
    Grant {
        user_id: String,
        amount: i64,
        source: String,
        description: String,
    },
    Balance {
        user_id: String,
    },
    Usage {
        user_id: String,
    },
    WorkloadList {
        owner: Option<String>,
        node: Option<String>,
    },
    WorkloadDelete {
        workload_id: String,
    },
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();
    parse_args_from_vec(&args)
}

fn positional(args: &[String], index: usize, what: &str) -> Result<String, String> {
    args.get(index)
        .cloned()
        .ok_or_else(|| format!("{} required", what))
}

fn parse_args_from_vec(args: &[String]) -> Result<Command, String> {
    if args.len() < 2 {
        return Err("No command specified".to_string());
    }

    match args[1].as_str() {
        "help" | "--help" | "-h" => Ok(Command::Help),
        "migrate" => Ok(Command::Migrate),
        "probe" => Ok(Command::Probe {
            address: positional(args, 2, "Address")?,
            token: positional(args, 3, "Token")?,
        }),
        "node-add" => {
            let mut name = None;
            let mut host = None;
            let mut port = None;
            let mut token = None;
            let mut ram_mb = None;
            let mut disk_mb = None;

            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--name" => {
                        i += 1;
                        name = Some(args.get(i).ok_or("--name requires a value")?.clone());
                    }
                    "--host" => {
                        i += 1;
                        host = Some(args.get(i).ok_or("--host requires a value")?.clone());
                    }
                    "--port" => {
                        i += 1;
                        port = Some(
                            args.get(i)
                                .ok_or("--port requires a number")?
                                .parse::<u16>()
                                .map_err(|_| "Invalid port")?,
                        );
                    }
                    "--token" => {
                        i += 1;
                        token = Some(args.get(i).ok_or("--token requires a value")?.clone());
                    }
                    "--ram-mb" => {
                        i += 1;
                        ram_mb = Some(
                            args.get(i)
                                .ok_or("--ram-mb requires a number")?
                                .parse::<i64>()
                                .map_err(|_| "Invalid RAM size")?,
                        );
                    }
                    "--disk-mb" => {
                        i += 1;
                        disk_mb = Some(
                            args.get(i)
                                .ok_or("--disk-mb requires a number")?
                                .parse::<i64>()
                                .map_err(|_| "Invalid disk size")?,
                        );
                    }
                    arg => return Err(format!("Unknown argument: {}", arg)),
                }
                i += 1;
            }

            Ok(Command::NodeAdd {
                name: name.ok_or("--name is required")?,
                host: host.ok_or("--host is required")?,
                port: port.ok_or("--port is required")?,
                token: token.ok_or("--token is required")?,
                ram_mb,
                disk_mb,
            })
        }
        "node-list" => Ok(Command::NodeList),
        "node-stats" => Ok(Command::NodeStats {
            node_id: positional(args, 2, "Node ID")?,
        }),
        "node-maintenance" => {
            let node_id = positional(args, 2, "Node ID")?;
            let enabled = match positional(args, 3, "on|off")?.as_str() {
                "on" => true,
                "off" => false,
                other => return Err(format!("Expected on or off, got '{}'", other)),
            };
            Ok(Command::NodeMaintenance { node_id, enabled })
        }
        "node-delete" => Ok(Command::NodeDelete {
            node_id: positional(args, 2, "Node ID")?,
        }),
        "user-add" => Ok(Command::UserAdd {
            username: positional(args, 2, "Username")?,
        }),
        "grant" => {
            let user_id = positional(args, 2, "User ID")?;
            let amount = positional(args, 3, "Amount")?
                .parse::<i64>()
                .map_err(|_| "Invalid amount")?;
            let mut source = "admin".to_string();
            let mut description = String::new();

            let mut i = 4;
            while i < args.len() {
                match args[i].as_str() {
                    "--source" => {
                        i += 1;
                        source = args.get(i).ok_or("--source requires a value")?.clone();
                    }
                    "--description" => {
                        i += 1;
                        description = args.get(i).ok_or("--description requires a value")?.clone();
                    }
                    arg => return Err(format!("Unknown argument: {}", arg)),
                }
                i += 1;
            }

            Ok(Command::Grant {
                user_id,
                amount,
                source,
                description,
            })
        }
        "balance" => Ok(Command::Balance {
            user_id: positional(args, 2, "User ID")?,
        }),
        "usage" => Ok(Command::Usage {
            user_id: positional(args, 2, "User ID")?,
        }),
        "workload-list" => {
            let mut owner = None;
            let mut node = None;

            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--owner" => {
                        i += 1;
                        owner = Some(args.get(i).ok_or("--owner requires a user ID")?.clone());
                    }
                    "--node" => {
                        i += 1;
                        node = Some(args.get(i).ok_or("--node requires a node ID")?.clone());
                    }
                    arg => return Err(format!("Unknown argument: {}", arg)),
                }
                i += 1;
            }

            Ok(Command::WorkloadList { owner, node })
        }
        "workload-delete" => Ok(Command::WorkloadDelete {
            workload_id: positional(args, 2, "Workload ID")?,
        }),
        cmd => Err(format!("Unknown command: {}", cmd)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hangar_control=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cmd = match parse_args() {
        Ok(Command::Help) => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match execute_command(&config, cmd).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn execute_command(config: &Config, cmd: Command) -> Result<()> {
    match cmd {
        Command::Migrate => {
            persistence::connect(&config.database_url)
                .await
                .context("failed to open database")?;
            println!("migrations applied");
            return Ok(());
        }
        Command::Probe { address, token } => {
            // Probing needs no database.
            let dialer = QuicDialer::new(&config.agent_config())?;
            let probe = NodeProbe::new(Arc::new(dialer)).with_timeouts(config.call_timeouts());
            let report = probe.probe(&address, &token).await;
            print_json(&report)?;
            if !report.is_reachable() {
                bail!("node is {}", report.status);
            }
            return Ok(());
        }
        Command::Help => return Ok(()),
        _ => {}
    }

    let plane = ControlPlane::connect(config)
        .await
        .context("failed to start control plane")?;
    let result = execute_with_plane(&plane, cmd).await;
    plane.shutdown().await;
    result
}

async fn execute_with_plane(plane: &ControlPlane, cmd: Command) -> Result<()> {
    match cmd {
        Command::NodeAdd {
            name,
            host,
            port,
            token,
            ram_mb,
            disk_mb,
        } => {
            let node = plane
                .nodes()
                .register_node(RegisterNode {
                    name,
                    host,
                    rpc_port: port,
                    daemon_token: token,
                    total_ram_mb: ram_mb,
                    total_disk_mb: disk_mb,
                })
                .await?;
            println!("{}", node.id);
        }
        Command::NodeList => print_json(&plane.nodes().list_nodes().await?)?,
        Command::NodeStats { node_id } => print_json(&plane.nodes().node_stats(&node_id).await?)?,
        Command::NodeMaintenance { node_id, enabled } => {
            let node = plane.nodes().set_maintenance(&node_id, enabled).await?;
            println!(
                "{} maintenance {}",
                node.name,
                if node.maintenance { "on" } else { "off" }
            );
        }
        Command::NodeDelete { node_id } => {
            plane.nodes().delete_node(&node_id).await?;
            println!("deleted {}", node_id);
        }
        Command::UserAdd { username } => {
            let user = plane.create_user(&username).await?;
            println!("{}", user.id);
        }
        Command::Grant {
            user_id,
            amount,
            source,
            description,
        } => {
            let pool = plane
                .ledger()
                .grant(&user_id, amount, &source, &description)
                .await?;
            print_json(&pool)?;
        }
        Command::Balance { user_id } => {
            let pool = plane.ledger().balance(&user_id).await?;
            let entries = plane.ledger().entries(&user_id, 20).await?;
            print_json(&serde_json::json!({
                "pool": pool,
                "entries": entries,
            }))?;
        }
        Command::Usage { user_id } => {
            plane.get_user(&user_id).await?;
            print_json(&plane.ledger().usage(&user_id).await?)?;
        }
        Command::WorkloadList { owner, node } => {
            let filter = WorkloadFilter {
                owner_id: owner,
                node_id: node,
            };
            print_json(&plane.workloads().list(&filter).await?)?;
        }
        Command::WorkloadDelete { workload_id } => {
            plane.workloads().delete(&workload_id).await?;
            println!("deleted {}", workload_id);
        }
        Command::Migrate | Command::Probe { .. } | Command::Help => {
            return Err(anyhow!("command handled before connecting"));
        }
    }
    Ok(())
}

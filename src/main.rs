//! Thriftroute entry point
//!
//! Dispatches CLI subcommands; `serve` (the default) starts the HTTP
//! control surface with the background registry refresh loop.

use clap::Parser;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use thriftroute::cli::{exit_code, Cli, Command, ConversationCommand};
use thriftroute::config::Config;
use thriftroute::error::RouterError;
use thriftroute::facade::{QueryRequest, RouterFacade};
use thriftroute::handlers::{build_router, AppState};
use thriftroute::store::export::{export_to_json, import_from_json, ExportDocument};
use thriftroute::store::ConversationFilters;
use thriftroute::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    telemetry::init("info");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e) as u8)
        }
    }
}

async fn run(args: Cli) -> Result<(), RouterError> {
    let config_path = args.config_path();
    let command = args.command.unwrap_or(Command::Serve);

    // Template generation must work before any configuration exists.
    if let Command::Config { output } = &command {
        let template = thriftroute::cli::generate_config_template();
        match output {
            Some(path) => std::fs::write(path, template).map_err(|e| {
                RouterError::Validation(format!("cannot write {}: {e}", path.display()))
            })?,
            None => print!("{template}"),
        }
        return Ok(());
    }

    let config = Config::from_file(&config_path)?;
    let facade = Arc::new(RouterFacade::new(config, Some(config_path)).await?);

    match command {
        Command::Serve => serve(facade).await,
        Command::Query {
            text,
            force,
            session,
        } => {
            // One-shot invocations have no background loop; scan first so
            // local runtimes are known.
            facade.refresh_registry().await;
            let reply = facade
                .handle_query(QueryRequest {
                    input: text,
                    force_model: force,
                    session_id: session,
                    ..Default::default()
                })
                .await?;
            if let Some(completion) = &reply.outcome.response {
                println!("{}", completion.text);
                eprintln!(
                    "[model: {} | cost: {:.6} | saved: {:.6} | attempts: {}]",
                    completion.model_key,
                    completion.cost,
                    completion.saved_cost,
                    reply.outcome.attempts.len()
                );
            }
            Ok(())
        }
        Command::Scan => {
            let change = facade.refresh_registry().await;
            let snapshot = facade.registry().snapshot_unchecked();
            println!(
                "scan complete: {} models ({} added, {} removed, {} updated)",
                snapshot.entries.len(),
                change.added.len(),
                change.removed.len(),
                change.updated.len()
            );
            Ok(())
        }
        Command::Stats => {
            print_json(&facade.stats())
        }
        Command::Models => {
            facade.refresh_registry().await;
            let snapshot = facade.registry().snapshot_unchecked();
            print_json(&serde_json::json!({
                "models": snapshot.list_all(),
                "last_scan": snapshot.last_scan_at,
                "cache_valid": !snapshot.is_stale(),
            }))
        }
        Command::Reload => {
            let config = facade.config();
            let url = format!(
                "http://{}:{}/router/config/reload",
                config.server.host, config.server.port
            );
            let response = reqwest::Client::new()
                .post(&url)
                .send()
                .await
                .map_err(|e| {
                    RouterError::Validation(format!("cannot reach the router at {url}: {e}"))
                })?;
            if response.status().is_success() {
                println!("configuration reloaded");
                Ok(())
            } else {
                Err(RouterError::Config(format!(
                    "reload failed: HTTP {}",
                    response.status()
                )))
            }
        }
        Command::Conversation { command } => conversation(facade, command).await,
        Command::Config { .. } => unreachable!("handled before configuration load"),
    }
}

async fn serve(facade: Arc<RouterFacade>) -> Result<(), RouterError> {
    facade.start_background_refresh();

    let config = facade.config();
    let state = AppState::new(facade);
    let app = build_router(state);

    let ip = config.server.host.parse::<std::net::IpAddr>().map_err(|e| {
        RouterError::Config(format!(
            "Invalid server.host '{}': {e}. Expected an IP address such as 0.0.0.0 or 127.0.0.1",
            config.server.host
        ))
    })?;
    let addr = SocketAddr::from((ip, config.server.port));

    tracing::info!(%addr, "Starting Thriftroute server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| RouterError::Config(format!("cannot bind {addr}: {e}")))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| RouterError::Config(format!("server error: {e}")))
}

async fn conversation(
    facade: Arc<RouterFacade>,
    command: ConversationCommand,
) -> Result<(), RouterError> {
    let store = facade.store();
    match command {
        ConversationCommand::List {
            topic,
            status,
            limit,
            offset,
            sort,
            ascending,
        } => {
            let filters = ConversationFilters {
                topic_id: topic,
                status: status.as_deref().map(str::parse).transpose()?,
                limit: Some(limit),
                offset: Some(offset),
                sort: sort.parse()?,
                ascending,
                ..Default::default()
            };
            let conversations = store.list_conversations(&filters).await?;
            print_json(&conversations)
        }
        ConversationCommand::Show { id } => {
            let conversation = store
                .get_conversation(id)
                .await?
                .ok_or_else(|| RouterError::NotFound(format!("conversation {id} does not exist")))?;
            let messages = store.get_messages(id, None, None).await?;
            print_json(&serde_json::json!({
                "conversation": conversation,
                "messages": messages,
            }))
        }
        ConversationCommand::Search { query, status } => {
            let filters = ConversationFilters {
                status: status.as_deref().map(str::parse).transpose()?,
                ..Default::default()
            };
            let hits = store.search_conversations(&query, &filters).await?;
            print_json(&hits)
        }
        ConversationCommand::Export { ids, output } => {
            let selected = if ids.is_empty() { None } else { Some(&ids[..]) };
            let document = export_to_json(store, selected, None).await?;
            let json = serde_json::to_string_pretty(&document)
                .map_err(|e| RouterError::Store(format!("cannot serialize export: {e}")))?;
            match output {
                Some(path) => std::fs::write(&path, json).map_err(|e| {
                    RouterError::Store(format!("cannot write {}: {e}", path.display()))
                })?,
                None => println!("{json}"),
            }
            Ok(())
        }
        ConversationCommand::Import { file } => {
            let content = std::fs::read_to_string(&file).map_err(|e| {
                RouterError::Validation(format!("cannot read {}: {e}", file.display()))
            })?;
            let document: ExportDocument = serde_json::from_str(&content)
                .map_err(|e| RouterError::Validation(format!("invalid export document: {e}")))?;
            let created = import_from_json(store, &document).await?;
            println!("imported {} conversations: {:?}", created.len(), created);
            Ok(())
        }
        ConversationCommand::Stats => print_json(&store.stats().await?),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), RouterError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| RouterError::Store(format!("cannot serialize output: {e}")))?;
    println!("{json}");
    Ok(())
}

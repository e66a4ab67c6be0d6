use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use arbor_contracts::events::EventWriter;
use arbor_contracts::records::{GenerationRecord, GenerationStatus};
use arbor_contracts::session::{ChatMessage, SessionCache};
use arbor_engine::assistant::{
    compile_prompt, ChatProvider, GeminiChatProvider, OfflineChatProvider, PromptAssistant,
};
use arbor_engine::config::{StorageBackendKind, StudioConfig};
use arbor_engine::gateway::{GeminiProvider, ImageGateway, ImageProvider, PreviewProvider, RetryPolicy};
use arbor_engine::store::{ArtifactStore, LocalBackend, RemoteBackend};
use arbor_engine::{GenerationLifecycle, RecordStore};
use clap::{Parser, Subcommand};
use serde_json::{json, Map};

#[derive(Debug, Parser)]
#[command(name = "arbor", version, about = "Arbor image studio CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive prompt-building conversation.
    Chat(ChatArgs),
    /// One-shot generation from a prompt.
    Generate(GenerateArgs),
    /// Print one generation record as JSON.
    Show(ShowArgs),
    /// List a user's recent generations.
    Recent(RecentArgs),
    /// Purge expired sessions from the cache.
    SweepSessions,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    user: String,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    label: Option<String>,
    #[arg(long)]
    style: Option<String>,
}

#[derive(Debug, Parser)]
struct ShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Parser)]
struct RecentArgs {
    #[arg(long)]
    user: String,
    #[arg(long, default_value_t = 20)]
    limit: u32,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("arbor error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = StudioConfig::from_env();
    match cli.command {
        Command::Chat(args) => run_chat(&config, &args),
        Command::Generate(args) => run_generate(&config, &args),
        Command::Show(args) => run_show(&config, &args),
        Command::Recent(args) => run_recent(&config, &args),
        Command::SweepSessions => run_sweep(&config),
    }
}

fn run_chat(config: &StudioConfig, args: &ChatArgs) -> Result<i32> {
    let assistant = build_assistant(config);
    let lifecycle = build_lifecycle(config)?;
    println!("Arbor studio chat. Commands: /set <field> <value>, /generate, /reset, /quit");

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/quit" {
            break;
        }
        if input == "/reset" {
            assistant.reset(&args.user);
            println!("session cleared");
            continue;
        }
        if let Some(rest) = input.strip_prefix("/set ") {
            let mut split = rest.splitn(2, ' ');
            let (Some(key), Some(value)) = (split.next(), split.next()) else {
                println!("usage: /set <field> <value>");
                continue;
            };
            assistant.set_answer(&args.user, key, json!(value.trim()));
            println!("{key} recorded");
            continue;
        }
        if input == "/generate" {
            let session = assistant.session(&args.user);
            let raw_input = session
                .messages
                .iter()
                .filter(|message| message.role == "user")
                .map(|message| message.content.clone())
                .collect::<Vec<String>>()
                .join(" ");
            if raw_input.trim().is_empty() {
                println!("nothing to generate yet; describe your image first");
                continue;
            }
            let prompt = compile_prompt(&raw_input, &session.prompt_state);
            let record = lifecycle.create(
                &args.user,
                &raw_input,
                session.prompt_state.clone(),
                session.messages.clone(),
                None,
            )?;
            lifecycle.begin(&record.id)?;
            let record = lifecycle.execute(&record.id, &prompt)?;
            println!("{}", summarize_record(&record));
            continue;
        }

        let (_, reply) = assistant.step(&args.user, input)?;
        println!("{reply}");
    }
    Ok(0)
}

fn run_generate(config: &StudioConfig, args: &GenerateArgs) -> Result<i32> {
    let lifecycle = build_lifecycle(config)?;
    let mut parameters = Map::new();
    if let Some(style) = &args.style {
        parameters.insert("style".to_string(), json!(style));
    }
    let transcript = vec![ChatMessage::new("user", args.prompt.as_str())];

    let record = lifecycle.create(
        &args.user,
        &args.prompt,
        parameters,
        transcript,
        args.label.clone(),
    )?;
    lifecycle.begin(&record.id)?;
    let record = lifecycle.execute(&record.id, &compile_prompt(&args.prompt, &Map::new()))?;

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(exit_code_for(&record))
}

fn run_show(config: &StudioConfig, args: &ShowArgs) -> Result<i32> {
    let lifecycle = build_lifecycle(config)?;
    let Some(record) = lifecycle.get(&args.id)? else {
        bail!("unknown generation {}", args.id);
    };
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(0)
}

fn run_recent(config: &StudioConfig, args: &RecentArgs) -> Result<i32> {
    let lifecycle = build_lifecycle(config)?;
    let records = lifecycle.list_for_user(&args.user, args.limit)?;
    if records.is_empty() {
        println!("no generations for {}", args.user);
        return Ok(0);
    }
    for record in &records {
        println!("{}", recent_line(record));
    }
    Ok(0)
}

fn run_sweep(config: &StudioConfig) -> Result<i32> {
    let cache = SessionCache::new(&config.session_cache_path, config.session_ttl_secs);
    let removed = cache.sweep_expired()?;
    println!("removed {removed} expired session(s)");
    Ok(0)
}

fn build_lifecycle(config: &StudioConfig) -> Result<GenerationLifecycle> {
    let store = RecordStore::open(&config.database_path)?;
    let gateway = ImageGateway::new(
        build_image_provider(config)?,
        RetryPolicy {
            max_attempts: config.max_attempts,
            ..RetryPolicy::default()
        },
    );
    let artifacts = build_artifact_store(config)?;
    Ok(GenerationLifecycle::new(
        store,
        gateway,
        artifacts,
        EventWriter::new(&config.events_path),
    ))
}

fn build_image_provider(config: &StudioConfig) -> Result<Box<dyn ImageProvider>> {
    match config.image_provider.as_str() {
        "preview" => Ok(Box::new(PreviewProvider)),
        "gemini" => {
            let api_key = config
                .api_key
                .clone()
                .context("ARBOR_API_KEY is required for the gemini image provider")?;
            let model = config
                .image_model
                .clone()
                .context("ARBOR_IMAGE_MODEL is required for the gemini image provider")?;
            Ok(Box::new(GeminiProvider::new(model, api_key)))
        }
        other => bail!("unknown image provider '{other}'"),
    }
}

fn build_artifact_store(config: &StudioConfig) -> Result<ArtifactStore> {
    match config.storage_backend {
        StorageBackendKind::Local => Ok(ArtifactStore::new(
            Box::new(LocalBackend::new(&config.storage_root)),
            None,
        )),
        StorageBackendKind::Remote => {
            let base_url = config
                .remote_storage_url
                .clone()
                .context("ARBOR_REMOTE_STORAGE_URL is required for remote storage")?;
            let api_key = config
                .remote_storage_key
                .clone()
                .context("ARBOR_REMOTE_STORAGE_KEY is required for remote storage")?;
            Ok(ArtifactStore::new(
                Box::new(RemoteBackend::new(
                    base_url,
                    config.remote_bucket.clone(),
                    api_key,
                )),
                Some(Box::new(LocalBackend::new(&config.storage_root))),
            ))
        }
    }
}

fn build_assistant(config: &StudioConfig) -> PromptAssistant {
    let provider: Box<dyn ChatProvider> = match (&config.chat_model, &config.api_key) {
        (Some(model), Some(api_key)) => {
            Box::new(GeminiChatProvider::new(model.clone(), api_key.clone()))
        }
        _ => Box::new(OfflineChatProvider),
    };
    PromptAssistant::new(
        SessionCache::new(&config.session_cache_path, config.session_ttl_secs),
        provider,
        EventWriter::new(&config.events_path),
    )
}

fn exit_code_for(record: &GenerationRecord) -> i32 {
    if record.status == GenerationStatus::Failed {
        2
    } else {
        0
    }
}

fn summarize_record(record: &GenerationRecord) -> String {
    let label = record.project_name.as_deref().unwrap_or("(unnamed)");
    match record.status {
        GenerationStatus::Completed => format!(
            "{label} [{}] completed: {}",
            record.id,
            record.image_url.as_deref().unwrap_or("")
        ),
        GenerationStatus::Failed => {
            let cause = record
                .failure
                .as_ref()
                .map(|failure| failure.message.as_str())
                .unwrap_or("unknown cause");
            format!("{label} [{}] failed: {cause}", record.id)
        }
        other => format!("{label} [{}] {other}", record.id),
    }
}

fn recent_line(record: &GenerationRecord) -> String {
    format!(
        "{}  {:<10}  {}  {}",
        record.created_at,
        record.status.as_str(),
        record.id,
        record.project_name.as_deref().unwrap_or("(unnamed)")
    )
}

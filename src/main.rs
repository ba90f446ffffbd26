use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use clap::{Parser, Subcommand};
use recog_core::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Face login and speech emotion recognition")]
struct Args {
    /// YAML config file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON file holding user records.
    #[arg(short, long, default_value = "users.json")]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify the emotion in an audio file.
    Classify {
        audio: PathBuf,
        /// Sample rate hint for raw or headerless input.
        #[arg(long, default_value_t = SAMPLE_RATE)]
        rate: u32,
    },
    /// List emotion labels with their colors and emojis.
    Emotions,
    /// Create or replace a user record.
    AddUser { id: u64, username: String },
    /// Register the face in an image for a user.
    RegisterFace {
        id: u64,
        image: PathBuf,
        #[arg(long)]
        disable_login: bool,
    },
    /// Log in with a face image.
    FaceLogin { image: PathBuf },
    /// Remove a user's registered face.
    RemoveFace { id: u64 },
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_image(path: &PathBuf) -> anyhow::Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => Config::from_path(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    let store = Arc::new(JsonUserStore::open(&args.store)?);
    let executor = Arc::new(Executor::start(cfg.executor.workers, cfg.executor.queue_depth)?);

    match args.command {
        Command::Classify { audio, rate } => {
            let data = std::fs::read(&audio).with_context(|| format!("reading {}", audio.display()))?;
            let svc = EmotionService::from_config(executor, &cfg.emotion);
            svc.initialize_model().await?;
            let res = svc.classify_audio(data, rate).await?;
            print_json(&serde_json::json!({
                "result": res,
                "color": res.color(),
                "emoji": res.emoji(),
            }))?;
        }
        Command::Emotions => print_json(&emotion::emotion_info())?,
        Command::AddUser { id, username } => {
            let user = UserRecord::new(id, username);
            store.insert(user.clone())?;
            print_json(&user)?;
        }
        Command::RegisterFace {
            id,
            image,
            disable_login,
        } => {
            let svc = FaceService::from_config(executor, store, &cfg.face)?;
            let res = svc.register_face(id, read_image(&image)?, !disable_login).await?;
            print_json(&res)?;
        }
        Command::FaceLogin { image } => {
            let svc = FaceService::from_config(executor, store, &cfg.face)?;
            let res = svc.authenticate_by_face(read_image(&image)?).await?;
            print_json(&res)?;
        }
        Command::RemoveFace { id } => {
            // Removal never touches the face models, so skip loading them.
            let matcher = FaceMatcher::new(store, cfg.face.tolerance, cfg.face.policy);
            let removed = executor.submit(move || matcher.remove(id))?.join().await??;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
    }

    Ok(())
}

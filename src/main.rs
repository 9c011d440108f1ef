mod config;
mod embed;
mod encoder;
mod models;
mod pack;
mod taxonomy;
mod visual;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};

use config::Config;
use encoder::OrtTextEncoder;
use models::ModelManager;
use taxonomy::Taxonomy;

#[derive(Parser)]
#[command(name = "triage-export")]
#[command(author = "MrMattias")]
#[command(version)]
#[command(about = "Export MobileCLIP runtime artifacts for zero-shot patient observation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Output directory for generated artifacts
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Alternate config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Export both artifacts: visual encoder and packed text embeddings
    Export,
    /// Compute and pack the text-embedding artifact only
    Embed,
    /// Consolidate and persist the visual encoder artifact only
    Visual,
    /// Print the category table of an existing embeddings artifact
    Inspect {
        /// Path to a packed embeddings file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(dir) = cli.output_dir {
        config.output.directory = dir;
    }

    match cli.command {
        None | Some(Commands::Export) => cmd_export(&config).await,
        Some(Commands::Embed) => cmd_embed(&config).await,
        Some(Commands::Visual) => cmd_visual(&config).await,
        Some(Commands::Inspect { path }) => cmd_inspect(&path),
    }
}

struct VisualReport {
    path: PathBuf,
    size: u64,
    input_size: Option<u32>,
}

struct EmbedReport {
    path: PathBuf,
    size: u64,
    embed_dim: usize,
}

async fn cmd_export(config: &Config) -> Result<()> {
    let manager = ModelManager::new(&config.model);
    let visual = export_visual(config, &manager).await?;
    let embeddings = export_embeddings(config, &manager).await?;

    println!("Export complete");
    println!(
        "  Visual encoder:  {} ({:.1} MB)",
        visual.path.display(),
        visual.size as f64 / (1024.0 * 1024.0)
    );
    println!(
        "  Text embeddings: {} ({:.1} KB)",
        embeddings.path.display(),
        embeddings.size as f64 / 1024.0
    );
    let input = visual
        .input_size
        .map(|s| format!("{s}x{s}"))
        .unwrap_or_else(|| "dynamic".to_string());
    println!("  Config: input={input}, embed_dim={}", embeddings.embed_dim);

    Ok(())
}

async fn cmd_embed(config: &Config) -> Result<()> {
    let manager = ModelManager::new(&config.model);
    let embeddings = export_embeddings(config, &manager).await?;
    println!(
        "Text embeddings: {} ({:.1} KB, embed_dim={})",
        embeddings.path.display(),
        embeddings.size as f64 / 1024.0,
        embeddings.embed_dim
    );
    Ok(())
}

async fn cmd_visual(config: &Config) -> Result<()> {
    let manager = ModelManager::new(&config.model);
    let visual = export_visual(config, &manager).await?;
    let input = visual
        .input_size
        .map(|s| format!("{s}x{s}"))
        .unwrap_or_else(|| "dynamic".to_string());
    println!(
        "Visual encoder: {} ({:.1} MB, input={input})",
        visual.path.display(),
        visual.size as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

async fn export_visual(config: &Config, manager: &ModelManager) -> Result<VisualReport> {
    fs::create_dir_all(&config.output.directory).with_context(|| {
        format!(
            "failed to create output directory {}",
            config.output.directory.display()
        )
    })?;

    eprintln!("Exporting visual encoder...");
    let staging_dir = config.output.directory.join("staging");
    let staged = manager.stage_visual(&staging_dir).await?;

    let dest = config.visual_path();
    let result = visual::consolidate(&staged, &dest);
    // Staging files go away whether or not consolidation succeeded.
    visual::cleanup_staging(&staged);
    let consolidated = result?;

    Ok(VisualReport {
        path: dest,
        size: consolidated.bytes_written,
        input_size: consolidated.input_size,
    })
}

async fn export_embeddings(config: &Config, manager: &ModelManager) -> Result<EmbedReport> {
    fs::create_dir_all(&config.output.directory).with_context(|| {
        format!(
            "failed to create output directory {}",
            config.output.directory.display()
        )
    })?;

    let text = manager.ensure_text_models().await?;

    eprintln!("Loading text encoder...");
    let mut encoder = OrtTextEncoder::load(
        &text.model,
        &text.tokenizer,
        text.spec.context_length,
        config.model.intra_threads,
    )?;

    let taxonomy = Taxonomy::nursing();
    eprintln!(
        "Computing text embeddings for {} labels in {} categories...",
        taxonomy.label_count(),
        taxonomy.len()
    );
    let bundle = embed::compute_embeddings(&taxonomy, &mut encoder)?;
    let embed_dim = bundle.embed_dim().unwrap_or(0);

    let dest = config.embeddings_path();
    let size = pack::write_embeddings_file(&dest, &bundle)?;

    Ok(EmbedReport {
        path: dest,
        size,
        embed_dim,
    })
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let categories = pack::parse_embeddings(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    println!("{} categories in {}", categories.len(), path.display());
    for (name, matrix) in &categories {
        let (min_norm, max_norm) = matrix.rows().into_iter().fold(
            (f32::INFINITY, f32::NEG_INFINITY),
            |(lo, hi), row| {
                let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
                (lo.min(norm), hi.max(norm))
            },
        );
        println!(
            "  {}: {} labels x {} dims, row norms {:.4}..{:.4}",
            name,
            matrix.nrows(),
            matrix.ncols(),
            min_norm,
            max_norm
        );
    }

    Ok(())
}

use anyhow::Context;
use clap::Parser;
use longireg::config::CaseConfig;
use longireg::engines::EngineSet;
use longireg::entry::run_case;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "Longitudinal MRI case classification and alignment")]
struct Args {
    /// Load pipeline settings from a TOML file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Case directory name under the upload root (e.g. M00123)
    #[arg(long)]
    case: String,
    /// Override the upload root from the config
    #[arg(long)]
    upload_root: Option<PathBuf>,
    /// Override the output root from the config
    #[arg(long)]
    out: Option<PathBuf>,
    /// Skip brain extraction and use all-true masks
    #[arg(long, default_value_t = false)]
    no_extract: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CaseConfig::load(path)?,
        None => CaseConfig::default(),
    };
    if let Some(upload_root) = args.upload_root {
        config.upload_root = upload_root;
    }
    if let Some(out) = args.out {
        config.out_dir = out;
    }
    if args.no_extract {
        config.extract_brain = false;
    }

    let engines = EngineSet::production(&config);
    let summary = run_case(&config, &args.case, &engines)
        .with_context(|| format!("processing case {}", args.case))?;

    println!("case {} -> {} studies written:", summary.case, summary.studies.len());
    for study in &summary.studies {
        println!("  {}: {}", study.date, study.files.join(", "));
    }
    Ok(())
}

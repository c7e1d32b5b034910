//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use anyhow::Context;
use eislab_core::Workbench;
use eislab_core::calibration::Calibration;
use eislab_core::config::EislabConfig;
use eislab_core::history::{HistoryQuery, HistoryStore, JsonHistoryStore, OwnerScope, SavedRun};
use eislab_core::signal;
use eislab_core::spatial::{self, Metric, SpatialMap};
use eislab_core::types::{AnalysisTopic, Dataset, DatasetKind};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Options of the `analyze` subcommand.
struct AnalyzeOptions {
    file: PathBuf,
    kind: DatasetKind,
    subject: String,
    topic: Option<AnalysisTopic>,
    calibration: Option<PathBuf>,
    save: bool,
    interactive: bool,
}

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    config: EislabConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    match command {
        Commands::Analyze {
            file,
            map,
            subject,
            topic,
            calibration,
            save,
            interactive,
        } => {
            let topic = topic
                .as_deref()
                .map(str::parse::<AnalysisTopic>)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let options = AnalyzeOptions {
                file,
                kind: if map { DatasetKind::Map } else { DatasetKind::Sweep },
                subject: subject.map(|s| s.trim().to_string()).unwrap_or_default(),
                topic,
                calibration,
                save,
                interactive,
            };
            handle_analyze(options, &config).await
        }
        Commands::History {
            subject,
            limit,
            json,
        } => handle_history(subject, limit, json, &config).await,
        Commands::Heatmap {
            file,
            frequency,
            metric,
            calibration,
            json,
        } => {
            let metric: Metric = metric.parse().map_err(anyhow::Error::msg)?;
            handle_heatmap(&file, frequency, metric, calibration.as_deref(), json, &config)
        }
        Commands::Calibration { file } => handle_calibration(file.as_deref(), &config),
        Commands::Config { action } => handle_config(action, workspace),
    }
}

async fn handle_analyze(options: AnalyzeOptions, config: &EislabConfig) -> anyhow::Result<()> {
    if options.save && options.subject.is_empty() {
        anyhow::bail!("--save needs a --subject to file the run under");
    }

    let coefficients = resolve_coefficients(options.calibration.as_deref(), config)?;
    let calibration =
        Calibration::from_coefficients(&coefficients, config.calibration.crossover_hz);
    let dataset = load_dataset(&options.file, options.kind, &calibration)?;
    if !calibration.is_empty() {
        println!("Applied calibration to {} points.", dataset.len());
    }

    let bench = Workbench::from_config(config)?;
    let session = bench.load(dataset, Some(coefficients)).await;
    println!(
        "Analyzing {} ({} points, {})...",
        options.file.display(),
        session.dataset().len(),
        session.kind()
    );

    let report = session.analyze(&options.subject, options.topic).await?;
    crate::repl::print_report(&report);

    let mut saved = false;
    if options.interactive {
        saved = crate::repl::run_follow_ups(&session, &options.subject).await?;
    }

    if options.save && !saved {
        let run = session.commit(&options.subject).await?;
        println!("Saved run {} for '{}'.", run.id, run.subject);
    }
    Ok(())
}

async fn handle_history(
    subject: Option<String>,
    limit: usize,
    json: bool,
    config: &EislabConfig,
) -> anyhow::Result<()> {
    let store = JsonHistoryStore::new(config.history.resolve_data_dir());
    let owner = OwnerScope::new(config.history.owner.clone());
    let query = HistoryQuery {
        subject: subject.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
        limit: Some(limit),
    };
    let runs = store.query(&owner, &query).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    if runs.is_empty() {
        println!("No saved runs for '{}'.", owner);
        return Ok(());
    }
    println!("Saved runs ({}):", runs.len());
    for run in &runs {
        println!("  {}", run_label(run));
    }
    Ok(())
}

fn handle_heatmap(
    file: &Path,
    frequency: Option<f64>,
    metric: Metric,
    calibration_file: Option<&Path>,
    json: bool,
    config: &EislabConfig,
) -> anyhow::Result<()> {
    let coefficients = resolve_coefficients(calibration_file, config)?;
    let calibration =
        Calibration::from_coefficients(&coefficients, config.calibration.crossover_hz);
    let dataset = load_dataset(file, DatasetKind::Map, &calibration)?;

    let frequencies = spatial::available_frequencies(&dataset.points);
    let frequency = match frequency {
        Some(f) => f,
        None => *frequencies
            .first()
            .ok_or_else(|| anyhow::anyhow!("{} has no data points", file.display()))?,
    };
    if !frequencies.contains(&frequency) {
        let listed: Vec<String> = frequencies.iter().map(|f| f.to_string()).collect();
        anyhow::bail!(
            "No layer at {} Hz. Available: {}",
            frequency,
            listed.join(", ")
        );
    }

    let layer = spatial::frequency_slice(&dataset.points, frequency);
    let map = spatial::aggregate(&layer, metric)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else {
        print!("{}", render_heatmap(&map, frequency));
    }
    Ok(())
}

fn handle_calibration(file: Option<&Path>, config: &EislabConfig) -> anyhow::Result<()> {
    let coefficients = resolve_coefficients(file, config)?;
    if coefficients.is_empty() {
        println!("No calibration coefficients configured.");
        return Ok(());
    }

    println!("Coefficients:");
    for (name, value) in &coefficients {
        println!("  {:<8} {}", name, value);
    }
    let calibration =
        Calibration::from_coefficients(&coefficients, config.calibration.crossover_hz);
    println!("\nCorrection:");
    for line in calibration.describe() {
        println!("  {}", line);
    }
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = eislab_core::config::workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }

            let toml_str = toml::to_string_pretty(&EislabConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = eislab_core::config::load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

/// Coefficients from `file`, or the configured defaults when no file is given.
fn resolve_coefficients(
    file: Option<&Path>,
    config: &EislabConfig,
) -> anyhow::Result<BTreeMap<String, f64>> {
    match file {
        Some(path) => read_coefficients(path),
        None => Ok(config.calibration.coefficients.clone()),
    }
}

/// Read a flat `name = value` coefficient table from TOML, or a JSON object.
fn read_coefficients(path: &Path) -> anyhow::Result<BTreeMap<String, f64>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read calibration file {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));

    let coefficients = if is_toml {
        toml::from_str(&text)
            .with_context(|| format!("Invalid calibration TOML in {}", path.display()))?
    } else {
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid calibration JSON in {}", path.display()))?
    };
    Ok(coefficients)
}

fn load_dataset(
    path: &Path,
    kind: DatasetKind,
    calibration: &Calibration,
) -> anyhow::Result<Dataset> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut dataset = signal::parse_csv(std::io::BufReader::new(file), kind)
        .with_context(|| format!("Could not read {} as a {}", path.display(), kind))?;
    if !calibration.is_empty() {
        dataset.points = calibration.apply_all(&dataset.points);
    }
    Ok(dataset)
}

/// One-line listing of a saved run.
fn run_label(run: &SavedRun) -> String {
    let title = run
        .conversation
        .iter()
        .rev()
        .find_map(|t| t.content.as_report())
        .map(|r| r.title.as_str())
        .unwrap_or("not analyzed");
    format!(
        "{}  {:<16} {:<5} {:>4} pts  {}",
        run.created_at.format("%Y-%m-%d %H:%M"),
        run.subject,
        run.kind.to_string(),
        run.points.len(),
        title
    )
}

fn render_heatmap(map: &SpatialMap, frequency: f64) -> String {
    let mut out = String::new();
    let Some(bounds) = map.bounds else {
        out.push_str("No points to map.\n");
        return out;
    };
    out.push_str(&format!(
        "Layer {} Hz, {} points, value range {:.2} .. {:.2}\n",
        frequency,
        map.samples.len(),
        bounds.value.min,
        bounds.value.max
    ));
    out.push_str(&format!(
        "{:>10} {:>10} {:>12} {:>6} {:>6}\n",
        "x", "y", "value", "norm", "hue"
    ));
    for s in &map.samples {
        out.push_str(&format!(
            "{:>10} {:>10} {:>12.2} {:>6.2} {:>6.0}\n",
            s.x,
            s.y,
            s.value,
            s.normalized,
            s.hue()
        ));
    }
    out
}

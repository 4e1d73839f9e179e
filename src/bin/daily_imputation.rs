use chrono::{Days, Utc};
use pv_gapfill::{
    engine_config_from_env, init_logging, log_app_start, logging_config_from_env,
    store_config_from_env, BuiltinModelLoader, ImputationEngine, ModelRegistry, SqliteStoreFactory,
    StationOutcome,
};

/// Usage: `daily_imputation [--json] [YYYY-MM-DD] [station ...]`
///
/// The date defaults to yesterday in the station timezone. Stations come from
/// the arguments, else `PVGF_STATIONS` (comma separated), else every
/// `<station>.sqlite` under the data root. `--json` prints the run summary as
/// JSON instead of one line per station.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("daily_imputation", &logging_cfg);

    let engine_cfg = engine_config_from_env();
    let store_cfg = store_config_from_env();

    let (flags, positional): (Vec<String>, Vec<String>) =
        std::env::args().skip(1).partition(|arg| arg.starts_with("--"));
    let json = match flags.as_slice() {
        [] => false,
        [flag] if flag == "--json" => true,
        other => return Err(format!("unknown flags: {}", other.join(" ")).into()),
    };
    let mut args = positional.into_iter();
    let date = match args.next() {
        Some(date) => date,
        None => {
            let today = engine_cfg
                .timezone
                .local_date(Utc::now().timestamp())
                .ok_or("current time is out of range")?;
            today
                .checked_sub_days(Days::new(1))
                .ok_or("cannot step back from the current date")?
                .to_string()
        }
    };

    let mut stations: Vec<String> = args.collect();
    if stations.is_empty() {
        stations = std::env::var("PVGF_STATIONS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
    }
    if stations.is_empty() {
        stations = discover_stations(&store_cfg.data_root)?;
    }
    if stations.is_empty() {
        return Err(format!(
            "no stations given and none found under {}",
            store_cfg.data_root.display()
        )
        .into());
    }

    let registry = ModelRegistry::load(
        &engine_cfg.model_dir,
        &engine_cfg.model_priority,
        &BuiltinModelLoader,
    );
    let engine = ImputationEngine::new(registry, engine_cfg);
    let factory = SqliteStoreFactory::new(store_cfg);

    let summary = engine.run_for_stations(&factory, &stations, &date)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        if summary.failed() > 0 {
            std::process::exit(1);
        }
        return Ok(());
    }

    for run in &summary.stations {
        match &run.outcome {
            StationOutcome::Completed(report) => println!(
                "{} {}: rows={} quality={} cohorts={} skipped={} filled={} unfilled={} fingerprint={}",
                run.station,
                report.date,
                report.rows_written,
                report.quality_records,
                report.cohorts,
                report.cohorts_skipped,
                report.matrices_filled,
                report.matrices_unfilled,
                report.fingerprint
            ),
            StationOutcome::Failed { error } => println!("{} {}: FAILED {}", run.station, summary.date, error),
        }
    }
    println!(
        "Done: {} succeeded, {} failed",
        summary.succeeded(),
        summary.failed()
    );

    if summary.failed() > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn discover_stations(root: &std::path::Path) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut stations = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("sqlite") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
            stations.push(stem.to_string());
        }
    }
    stations.sort();
    Ok(stations)
}

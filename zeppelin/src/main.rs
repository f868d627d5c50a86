use std::env;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info};

use zeppelin::config::ServiceConfig;
use zeppelin::metrics::{self, Metrics};
use zeppelin::monitor::{monitored_files, ConfigManager};
use zeppelin::pipeline::Pipeline;

const DEFAULT_CONFIG_FILENAME: &str = "/config/zeppelin.json";
const DEFAULT_PROMETHEUS_PORT: u16 = 8000;
const CHECK_CONFIG_INTERVAL: Duration = Duration::from_secs(10);

fn init_logging() {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("LOGGING_LEVEL", "info"),
    );

    if let Ok(path) = env::var("LOGGING_FILENAME") {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("unable to open log file {path}: {e}"),
        }
    }

    builder.init();
}

fn build_pipelines(config_path: &Path, metrics: &Arc<Metrics>) -> Result<Vec<Pipeline>> {
    let config = ServiceConfig::load(config_path)?;

    metrics.set_version(&config.version, &config.version_date, "zeppelin");
    info!(
        "version({}) version_date({})",
        config.version, config.version_date
    );

    config
        .pipelines()
        .iter()
        .map(|pipeline| Pipeline::build(&config, pipeline, metrics.clone()))
        .collect()
}

fn start_all(pipelines: &mut [Pipeline]) -> Result<()> {
    info!("starting pipelines");
    for pipeline in pipelines.iter_mut() {
        pipeline
            .start()
            .with_context(|| format!("pipeline({}) start failed", pipeline.name()))?;
    }
    info!("all pipelines started");
    Ok(())
}

fn stop_all(pipelines: &mut Vec<Pipeline>) {
    info!("stopping pipelines");
    for pipeline in pipelines.iter() {
        pipeline.stop();
    }
    for pipeline in pipelines.iter_mut() {
        pipeline.join();
    }
    pipelines.clear();
    info!("all pipelines stopped");
}

fn main() {
    init_logging();

    let config_path =
        PathBuf::from(env::var("CONFIG_FILENAME").unwrap_or_else(|_| DEFAULT_CONFIG_FILENAME.to_owned()));

    if !config_path.is_file() {
        error!("config file({}) not found", config_path.display());
        process::exit(1);
    }

    // watch the main config plus every file the pipelines pull in
    let mut monitor = ConfigManager::new();
    for file in monitored_files(&config_path) {
        monitor.add(&file);
    }

    let metrics = match Metrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            error!("metrics init failed: {e:#}");
            process::exit(1);
        }
    };

    let prometheus_port = env::var("PROMETHEUS_PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(DEFAULT_PROMETHEUS_PORT);
    if let Err(e) = metrics::serve(metrics.clone(), prometheus_port) {
        error!("metrics endpoint init failed: {e:#}");
        process::exit(1);
    }

    let mut pipelines = match build_pipelines(&config_path, &metrics) {
        Ok(pipelines) => pipelines,
        Err(e) => {
            error!("{e:#}");
            process::exit(2);
        }
    };

    if let Err(e) = start_all(&mut pipelines) {
        error!("{e:#}");
        process::exit(3);
    }

    loop {
        thread::sleep(CHECK_CONFIG_INTERVAL);

        if monitor.is_modified() {
            info!("config file modified");
            stop_all(&mut pipelines);

            pipelines = match build_pipelines(&config_path, &metrics) {
                Ok(pipelines) => pipelines,
                Err(e) => {
                    error!("{e:#}");
                    process::exit(2);
                }
            };

            if let Err(e) = start_all(&mut pipelines) {
                error!("{e:#}");
                process::exit(3);
            }
        }
    }
}

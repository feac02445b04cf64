use std::path::PathBuf;

use cmi::{
    init_logging, log_app_start, log_source_selected, logging_config_from_env,
    pipeline_config_from_env, run_etl,
};

/// Usage: `cmi_etl [OUT_CSV]`. Symbol, interval and limit come from `CMI_*` variables.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("cmi_etl", &logging_cfg);

    let config = pipeline_config_from_env();
    let out_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| config.prices_csv.clone());

    log_source_selected("cmi_etl", "binance", None);
    let records = run_etl(&config.fetch, &config.market_data, &out_path)?;

    println!(
        "wrote {} {} {} rows to {}",
        records.len(),
        config.fetch.symbol,
        config.fetch.interval.as_str(),
        out_path.display()
    );
    Ok(())
}

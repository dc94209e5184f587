//! WebAssembly bindings. JSON strings in, JSON strings out.

use wasm_bindgen::prelude::*;

use crate::config::Config;
use crate::wire::{self, Naming};

fn config_for(naming: &str) -> std::result::Result<Config, String> {
    let mut config = Config::default();
    config.output.pretty = false;
    if !naming.is_empty() {
        config.output.naming = naming.parse::<Naming>().map_err(|err| {
            wire::to_json_string(&wire::render_error(&err, Naming::Legacy), false)
        })?;
    }
    Ok(config)
}

/// Run one operation (`glucose`, `profile`, `iob`, `meal`, `autosens`,
/// `determine-basal`). An empty `naming` means legacy.
#[wasm_bindgen]
pub fn run(operation: &str, input: &str, naming: &str) -> String {
    match config_for(naming) {
        Ok(config) => wire::run_json(operation, input, &config),
        Err(body) => body,
    }
}

#[wasm_bindgen(js_name = determineBasal)]
pub fn determine_basal(input: &str) -> String {
    run("determine-basal", input, "")
}

#[wasm_bindgen(js_name = calculateIob)]
pub fn calculate_iob(input: &str) -> String {
    run("iob", input, "")
}

#[wasm_bindgen(js_name = calculateMeal)]
pub fn calculate_meal(input: &str) -> String {
    run("meal", input, "")
}

#[wasm_bindgen(js_name = detectSensitivity)]
pub fn detect_sensitivity(input: &str) -> String {
    run("autosens", input, "")
}

#[wasm_bindgen]
pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

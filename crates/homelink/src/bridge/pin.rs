use std::path::Path;

use serde::Deserialize;
use tracing::debug;

#[derive(Deserialize)]
struct HomebridgeConfig {
    bridge: Option<BridgeSection>,
}

#[derive(Deserialize)]
struct BridgeSection {
    pin: Option<String>,
}

/// Find the bridge PIN in the nearest `config.json` at or above `start`.
///
/// Homebridge keeps its PIN under `bridge.pin` in `config.json`. Unreadable
/// or unrelated `config.json` files are skipped and the search continues
/// upwards.
pub fn find_config_pin(start: &Path) -> Option<String> {
    search(start.ancestors())
}

fn search<'a>(dirs: impl Iterator<Item = &'a Path>) -> Option<String> {
    for dir in dirs {
        let candidate = dir.join("config.json");
        let Ok(contents) = std::fs::read_to_string(&candidate) else {
            continue;
        };

        match serde_json::from_str::<HomebridgeConfig>(&contents) {
            Ok(HomebridgeConfig {
                bridge: Some(BridgeSection { pin: Some(pin) }),
            }) => {
                debug!("[hap] Using bridge PIN from {}", candidate.display());
                return Some(pin);
            }
            Ok(_) => {}
            Err(e) => debug!("[hap] Ignoring {}: {}", candidate.display(), e),
        }
    }
    None
}

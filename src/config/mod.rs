//! Unified configuration system.
//!
//! Consolidates configuration from four tiers with field-by-field YAML merging:
//! 1. **Defaults** - built into the binary
//! 2. **Project** - `$CWD/mission-control/config.yaml`
//! 3. **User** - `~/.mission-control/config.yaml`
//! 4. **Environment** - variables below
//!
//! ## Environment Variables
//! - `MISSION_CONTROL_CONFIG_PATH` - Explicit config file (replaces the tier merge)
//! - `MISSION_CONTROL_DATA_PATH` - JSON data file
//! - `MISSION_CONTROL_PORT` - REST API port
//! - `MISSION_CONTROL_USER_DIR` - User config dir (default: `~/.mission-control`)
//! - `MISSION_CONTROL_PROJECT_DIR` - Project config dir (default: `./mission-control`)
//! - `OPENCLAW_GATEWAY_URL` - Agent-runner gateway URL
//! - `OPENCLAW_GATEWAY_TOKEN` - Bearer token for the gateway

mod loader;
mod types;

pub use loader::{ConfigLoader, ConfigPaths, ConfigTier, apply_env_overrides};
pub use types::*;

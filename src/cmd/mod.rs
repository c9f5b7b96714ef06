//! CLI command implementations.
//!
//! | Module    | Commands handled                     |
//! |-----------|--------------------------------------|
//! | `serve`   | `Serve`                              |
//! | `run`     | `Run`                                |
//! | `remote`  | `Submit`, `Task`, `Builders`         |
//! | `servers` | `Servers`                            |
//! | `config`  | `Config`                             |

pub mod config;
pub mod remote;
pub mod run;
pub mod serve;
pub mod servers;

pub use config::cmd_config;
pub use remote::{cmd_builders, cmd_submit, cmd_task};
pub use run::cmd_run;
pub use serve::cmd_serve;
pub use servers::cmd_servers;

use anyhow::Result;
use buildq_common::BuildRequest;

use super::BuildArgs;

/// Turns CLI build arguments into a request.
pub fn build_request(args: &BuildArgs) -> Result<BuildRequest> {
    let mut request = BuildRequest::new(&args.builder, &args.sources, &args.workspace, &args.project);
    request.options.targets = args.targets.clone();
    request.options.skip_test = args.skip_test;
    request.options.timeout_secs = args.timeout_secs;
    request.environment = args.environment.clone();
    for option in &args.options {
        let Some((key, value)) = option.split_once('=') else {
            anyhow::bail!("Invalid option '{}': expected KEY=VALUE", option);
        };
        request.options.options.insert(key.to_string(), value.to_string());
    }
    Ok(request)
}

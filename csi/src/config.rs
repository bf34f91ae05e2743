//! Process-wide configuration, resolved from command-line flags with
//! environment-variable fallback (spec.md §6 configuration table).
//!
//! Ground: the teacher's `config.rs` lazy_static global-mutex-of-`Config`
//! shape and `TryFrom<&ArgMatches>` parsing chain, generalized from
//! NVMe-specific knobs to this plugin's images-dir/topology/grpc knobs —
//! this config carries no volume state, consistent with spec.md §3's "the
//! filesystem is the source of truth".

use clap::ArgMatches;
use std::convert::TryFrom;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub log_json: bool,
    pub grpc_listen_socket: String,
    pub images_dir: String,
    pub node: String,
    pub node_name_topology_key: String,
    pub direct_io: bool,
}

fn env_or(flag_value: Option<&str>, env_name: &str) -> Option<String> {
    flag_value
        .map(|v| v.to_string())
        .or_else(|| std::env::var(env_name).ok())
}

fn env_bool(flag_present: bool, env_name: &str) -> bool {
    flag_present || matches!(std::env::var(env_name).as_deref(), Ok("true") | Ok("1"))
}

impl TryFrom<&ArgMatches<'_>> for Config {
    type Error = String;

    fn try_from(matches: &ArgMatches<'_>) -> Result<Self, Self::Error> {
        let grpc_listen_socket =
            env_or(matches.value_of("grpc-listen-socket"), "GRPC_LISTEN_SOCKET")
                .ok_or("grpc-listen-socket (or GRPC_LISTEN_SOCKET) is required")?;
        if !grpc_listen_socket.starts_with("unix://") {
            return Err(format!(
                "grpc-listen-socket must use the unix:// scheme, got {}",
                grpc_listen_socket
            ));
        }

        let images_dir = env_or(matches.value_of("images-dir"), "IMAGES_DIR")
            .ok_or("images-dir (or IMAGES_DIR) is required")?;
        if !std::path::Path::new(&images_dir).is_dir() {
            return Err(format!("images-dir {} does not exist", images_dir));
        }

        let node = env_or(matches.value_of("node"), "NODE_ID")
            .ok_or("node (or NODE_ID) is required")?;

        let node_name_topology_key = env_or(
            matches.value_of("node-name-topology-key"),
            "NODE_NAME_TOPOLOGY_KEY",
        )
        .ok_or("node-name-topology-key (or NODE_NAME_TOPOLOGY_KEY) is required")?;

        let log_level =
            env_or(matches.value_of("log-level"), "LOG_LEVEL").unwrap_or_else(|| "info".into());

        let log_json = env_bool(matches.is_present("log-json"), "LOG_JSON");
        let direct_io = env_bool(matches.is_present("direct-io"), "DIRECT_IO");

        Ok(Config {
            log_level,
            log_json,
            grpc_listen_socket,
            images_dir,
            node,
            node_name_topology_key,
            direct_io,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{App, Arg};

    fn app() -> App<'static, 'static> {
        App::new("test")
            .arg(Arg::with_name("grpc-listen-socket").long("grpc-listen-socket").takes_value(true))
            .arg(Arg::with_name("images-dir").long("images-dir").takes_value(true))
            .arg(Arg::with_name("node").long("node").takes_value(true))
            .arg(
                Arg::with_name("node-name-topology-key")
                    .long("node-name-topology-key")
                    .takes_value(true),
            )
            .arg(Arg::with_name("direct-io").long("direct-io"))
            .arg(Arg::with_name("log-level").long("log-level").takes_value(true))
            .arg(Arg::with_name("log-json").long("log-json"))
    }

    #[test]
    fn rejects_non_unix_socket_scheme() {
        let images_dir = std::env::temp_dir();
        let matches = app().get_matches_from(vec![
            "test",
            "--grpc-listen-socket",
            "tcp://127.0.0.1:1234",
            "--images-dir",
            images_dir.to_str().unwrap(),
            "--node",
            "n1",
            "--node-name-topology-key",
            "hostname",
        ]);
        assert!(Config::try_from(&matches).is_err());
    }

    #[test]
    fn rejects_missing_images_dir() {
        let matches = app().get_matches_from(vec![
            "test",
            "--grpc-listen-socket",
            "unix:///tmp/does-not-matter.sock",
            "--images-dir",
            "/no/such/directory/really",
            "--node",
            "n1",
            "--node-name-topology-key",
            "hostname",
        ]);
        assert!(Config::try_from(&matches).is_err());
    }

    #[test]
    fn accepts_well_formed_flags() {
        let images_dir = std::env::temp_dir();
        let matches = app().get_matches_from(vec![
            "test",
            "--grpc-listen-socket",
            "unix:///tmp/csi.sock",
            "--images-dir",
            images_dir.to_str().unwrap(),
            "--node",
            "n1",
            "--node-name-topology-key",
            "hostname",
            "--direct-io",
        ]);
        let config = Config::try_from(&matches).unwrap();
        assert_eq!(config.node, "n1");
        assert_eq!(config.node_name_topology_key, "hostname");
        assert!(config.direct_io);
        assert_eq!(config.log_level, "info");
    }
}

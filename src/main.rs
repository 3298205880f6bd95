use std::path::Path;
use std::sync::Arc;

use gateway::configuration::ServerConfig;
use gateway::metric::Metrics;
use gateway::server::Server;
use pingora::server::configuration::Opt;

fn main() {
    // Enable basic logging; set RUST_LOG=info for visibility.
    env_logger::init();

    let opt = Opt::parse_args();
    // Pingora reads its own settings from the same file; the gateway keys
    // live alongside them.
    let conf_path = opt.conf.clone().unwrap_or_else(|| "conf.yaml".to_string());

    let server_conf =
        ServerConfig::from_yaml_file(&conf_path).expect("Failed to load server config");
    let base = Path::new(&conf_path)
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let mut server = Server::new(Some(opt)).expect("Failed to create server");
    server
        .bootstrap(server_conf, &base, Arc::new(Metrics::default()))
        .expect("Failed to bootstrap server");

    server.run_forever();
}

use hopper_http::handler::{RouteOutcome, handler_fn};
use hopper_web::{DirHandler, FileHandler, Server, ServerBuilder, ServerConfig};

/// Serves the routes of a JSON configuration file, plus a few built-in ones.
///
/// ```sh
/// cargo run --example server -- hopper.json
/// ```
#[tokio::main]
async fn main() {
    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                return;
            }
        },
        None => ServerConfig { listen: vec!["127.0.0.1:3000".to_string()], ..ServerConfig::default() },
    };

    let server = ServerBuilder::from_config(&config)
        .handler(
            "/hello",
            handler_fn(|req| match req.query_param("name") {
                Some(name) => format!("hello {name}").into(),
                None => RouteOutcome::Text("hello world".to_string()),
            }),
        )
        .handler("/readme", FileHandler::new("README.md").with_ranges(true))
        .handler("/files", DirHandler::new(".").with_index("index.html").with_ranges(true))
        .build();

    let server: Server = match server {
        Ok(server) => server,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    if let Err(e) = server.start().await {
        eprintln!("{e}");
    }
}

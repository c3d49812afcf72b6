use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;

pub fn setup_logging(verbose_level: u8, log_file: Option<PathBuf>) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        // Use RUST_LOG if set
        tracing_subscriber::EnvFilter::from_default_env()
    } else {
        // Map verbosity count to filters
        let filter_str = match verbose_level {
            0 => "warn,studio_proxy=info",
            1 => "warn,studio_proxy=debug",
            _ => "info,studio_proxy=trace",
        };
        tracing_subscriber::EnvFilter::new(filter_str)
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    let file = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!(
                    "Warning: Could not open log file {:?} ({}), falling back to stderr",
                    path, e
                );
                None
            }
        }
    });

    match file {
        Some(file) => subscriber
            .with_ansi(false)
            .with_writer(move || -> Box<dyn io::Write + Send> {
                match file.try_clone() {
                    Ok(handle) => Box::new(handle),
                    Err(_) => Box::new(io::stderr()),
                }
            })
            .init(),
        None => subscriber.with_writer(io::stderr).init(),
    }
}

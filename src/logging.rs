/// Log to stderr. `RUST_LOG` overrides the default `info` level.
pub fn init() {
    let env = env_logger::Env::default().default_filter_or("info");
    if let Err(e) = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init()
    {
        eprintln!("Logger already initialized: {e}");
    }
}

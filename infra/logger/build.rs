use std::env;

const WATCHED: [&str; 2] = ["CARGO_FEATURE_PROFILING", "CARGO_CFG_TOKIO_UNSTABLE"];

fn main() {
    for var in WATCHED {
        println!("cargo:rerun-if-env-changed={var}");
    }

    let [profiling, tokio_unstable] = WATCHED.map(|var| env::var_os(var).is_some());
    if profiling && !tokio_unstable {
        // The console layer compiles out silently without the cfg.
        println!(
            "cargo:warning=qhub-logger: `profiling` has no effect without `--cfg tokio_unstable`; \
             export RUSTFLAGS=\"--cfg tokio_unstable\" to attach tokio-console"
        );
    }
}

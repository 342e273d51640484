mod live_tests;

use lazy_static::lazy_static;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

const RUN_LIVE_TESTS: &str = "RUN_LIVE_TESTS";

lazy_static! {
    pub static ref LIVE_TESTS_ENABLED: bool = {
        match std::env::var(RUN_LIVE_TESTS) {
            Ok(_) => true,
            Err(_) => {
                println!("Skipping live transport tests: RUN_LIVE_TESTS not set");
                false
            }
        }
    };
}

pub fn should_run_live_tests() -> bool {
    *LIVE_TESTS_ENABLED
}

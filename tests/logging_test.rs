//! Global tracing setup. Kept in its own test binary because the subscriber is
//! process-wide.

use hv_daq::logging::{self, LogFormat, TracingConfig};
use tracing::Level;

#[test]
fn init_installs_once_and_tolerates_repeats() {
    assert!(!tracing::dispatcher::has_been_set());

    logging::init(TracingConfig::new(Level::INFO).with_format(LogFormat::Compact)).unwrap();
    assert!(tracing::dispatcher::has_been_set());
    tracing::info!("Subscriber installed");

    logging::init(TracingConfig::new(Level::DEBUG).with_format(LogFormat::Json)).unwrap();
    logging::init(TracingConfig::new(Level::WARN)).unwrap();
}

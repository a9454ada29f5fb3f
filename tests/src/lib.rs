//! FIM Testing Framework
//!
//! Mock connectors and generators for exercising pipelines without real transports.
//! A [`MockSourceConnector`] plays the inbound side: [`MockSourceConnector::trigger`] feeds
//! a payload through the request mapping, the bound process and the response mapping, the way
//! an HTTP or queue connector would. A [`MockTargetConnector`] records what each step sent it
//! and answers with a stubbed reply.

pub mod source;
pub mod target;

pub use source::{MockResponse, MockSourceConnector, MockSourceGenerator};
pub use target::{MockTargetConnector, MockTargetGenerator};

use fim_kernel::connector::ConnectorError;

/// Option that makes a mock connector refuse to start.
pub const OPTION_FAIL_START: &str = "fail_start";

fn start_failure(name: &str) -> ConnectorError {
    ConnectorError::Other(format!("{name} refused to start"))
}

#[macro_export]
macro_rules! assert_triggered {
    ($connector:expr, $expected_count:expr) => {
        let count = $connector.call_count().await;
        assert_eq!(
            count, $expected_count,
            "Expected connector '{}' to be triggered {} times, but was triggered {} times",
            $connector.instance_name(),
            $expected_count,
            count
        );
    };
}

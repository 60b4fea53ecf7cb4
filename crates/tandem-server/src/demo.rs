//! Method and stream table served by `tandem-server serve`.

use serde_json::Value;
use std::time::Duration;
use tandem_rpc::Callee;
use tracing::debug;

/// How often the `echo` stream repeats its value.
const ECHO_INTERVAL: Duration = Duration::from_millis(100);

/// `echo(x) = x`, plus an `echo` stream that publishes its argument every
/// 100ms until unsubscribed.
pub fn callee() -> Callee {
    Callee::builder()
        .method("echo", |params| async move {
            Ok(params.into_iter().next().unwrap_or(Value::Null))
        })
        .stream("echo", |publisher, params| {
            let value = params.into_iter().next().unwrap_or(Value::Null);
            let task = tokio::spawn(async move {
                let mut interval = tokio::time::interval(ECHO_INTERVAL);
                loop {
                    interval.tick().await;
                    match publisher.publish(value.clone()).await {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!("Subscriber dropped {}", publisher.subscription());
                            break;
                        }
                        Err(e) => {
                            debug!("Publishing to {} failed: {}", publisher.subscription(), e);
                            break;
                        }
                    }
                }
            });
            Ok(move || task.abort())
        })
        .build()
}

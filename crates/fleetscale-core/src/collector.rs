//! Metric collector interface.
//!
//! A collector produces one named float per call, scoped to an app. The
//! reconciler invokes its collectors sequentially each tick; a single
//! failure aborts the whole tick so bounds are never evaluated against a
//! partial environment.

use async_trait::async_trait;

/// A client for collecting one metric value from an external source.
#[async_trait]
pub trait MetricCollector: Send + Sync {
    /// Stable identifier, used as the metric key in bound expressions.
    fn name(&self) -> &str;

    /// Fetch the current value for the given app.
    async fn collect(&self, app_name: &str) -> anyhow::Result<f64>;
}

/// Expand `$APP_NAME` / `${APP_NAME}` references in a metric query.
///
/// Unknown variables expand to the empty string.
pub fn expand_metric_query(query: &str, app_name: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let mut name = String::new();
        if let Some(&(_, '{')) = chars.peek() {
            chars.next();
            for (_, c) in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
        } else {
            while let Some(&(_, c)) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
        }

        if name == "APP_NAME" {
            out.push_str(app_name);
        } else if name.is_empty() {
            out.push('$');
        }
        // Unknown variables expand to "".
    }

    out
}

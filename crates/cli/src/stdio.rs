//! JSON Lines host: bridges the relay's message channel over stdin/stdout.
//!
//! Each input line is a message from the widget, either bare or wrapped as
//! `{"origin": "...", "data": {...}}`. Each post into the widget frame is
//! written as one `{"frame", "targetOrigin", "data"}` line.

use std::{sync::Arc, time::Duration};

use {
    embed_relay::{ForwardingFrame, MessageChannel, MessageEvent, Relay, StaticDocument},
    embed_relay_config::RelayConfig,
    serde::Serialize,
    serde_json::Value,
    tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    tracing::{debug, info, warn},
};

/// How long to wait for in-flight operations after input closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundLine<'a> {
    frame: &'a str,
    target_origin: &'a str,
    data: &'a Value,
}

/// Run the relay until `input` reaches EOF or the process is interrupted.
pub async fn run_host<R, W>(config: RelayConfig, input: R, output: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let channel = MessageChannel::new();
    let document = Arc::new(StaticDocument::new());
    let (frame, mut posts) = ForwardingFrame::new();
    document.insert_frame(config.relay.frame_id.clone(), Arc::new(frame));

    let relay = Relay::new(&config, channel.clone(), document.clone())?;
    let registration = relay.setup();

    let frame_id = config.relay.frame_id.clone();
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(posted) = posts.recv().await {
            let line = OutboundLine {
                frame: &frame_id,
                target_origin: &posted.target_origin,
                data: &posted.message,
            };
            let mut text = serde_json::to_string(&line)?;
            text.push('\n');
            output.write_all(text.as_bytes()).await?;
            output.flush().await?;
        }
        anyhow::Ok(())
    });

    info!(
        frame_id = %config.relay.frame_id,
        http_url = %config.backend.http_url,
        ws_url = %config.backend.ws_url,
        "stdio host ready"
    );

    let mut lines = input.lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Some(event) = parse_line(&line, &config.relay.widget_origin) {
                        channel.dispatch(&event);
                    }
                },
                None => {
                    debug!("input closed");
                    break;
                },
            },
            _ = &mut shutdown => {
                info!("interrupted, shutting down");
                break;
            },
        }
    }

    // Tearing down releases subscriptions; dropping the document lets the
    // writer finish once in-flight operations have posted.
    drop(registration);
    drop(relay);
    drop(document);

    match tokio::time::timeout(DRAIN_TIMEOUT, writer).await {
        Ok(joined) => joined??,
        Err(_) => warn!("in-flight operations did not finish before exit"),
    }
    Ok(())
}

/// Parse one input line. Blank and unparseable lines yield `None`.
pub(crate) fn parse_line(line: &str, default_origin: &str) -> Option<MessageEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "skipping unparseable input line");
            return None;
        },
    };

    if let Some(object) = value.as_object()
        && !object.contains_key("name")
        && let Some(data) = object.get("data")
    {
        let origin = object
            .get("origin")
            .and_then(Value::as_str)
            .unwrap_or(default_origin);
        return Some(MessageEvent::new(origin, data.clone()));
    }

    Some(MessageEvent::new(default_origin, value))
}

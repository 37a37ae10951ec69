//! Downstream stdio surface: stdin/stdout carry JSON-RPC requests for a
//! single, implicit session, framed either newline-delimited or
//! Content-Length-prefixed. The framing the peer first uses is adopted for
//! the rest of the connection, mirroring the auto-detection the upstream
//! connector applies to its own stdio peers (spec §6, §4.1).

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::hub::Hub;

const CONTENT_LENGTH_PREFIX: &str = "content-length:";
/// Single implicit session bound to this process's stdio connection; a
/// stdio peer is inherently one client, so there is no `mcp-session-id`
/// negotiation the way the HTTP surface has.
const STDIO_SESSION_ID: &str = "stdio";

enum Framing {
    NewlineDelimited,
    ContentLength,
}

/// Serve one downstream JSON-RPC stdio connection to completion (until EOF).
pub async fn serve<R, W>(hub: Arc<Hub>, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    hub.sessions
        .create_session(Some(STDIO_SESSION_ID.to_string()), Duration::from_secs(u64::MAX / 2), json!({}));

    let mut reader = BufReader::new(reader);
    let mut framing: Option<Framing> = None;

    loop {
        let message = match &framing {
            None => {
                let Some((detected, message)) = read_first_message(&mut reader).await? else {
                    return Ok(());
                };
                framing = Some(detected);
                message
            }
            Some(Framing::NewlineDelimited) => match read_newline_message(&mut reader).await? {
                Some(message) => message,
                None => return Ok(()),
            },
            Some(Framing::ContentLength) => match read_content_length_message(&mut reader).await? {
                Some(message) => message,
                None => return Ok(()),
            },
        };

        let Some(body) = parse_request(&message) else {
            continue;
        };
        let response = handle_one(&hub, body).await;
        write_message(&mut writer, &response, matches!(framing, Some(Framing::ContentLength))).await?;
    }
}

fn parse_request(line: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(line) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(error = %error, "discarding malformed downstream stdio message");
            None
        }
    }
}

async fn handle_one(hub: &Arc<Hub>, body: Value) -> Value {
    let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
    let params = body.get("params").cloned().unwrap_or(Value::Null);
    let id = body.get("id").cloned();

    match hub.handle_request(method, params, STDIO_SESSION_ID).await {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(error) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": error.json_rpc_code(), "message": error.to_string()},
        }),
    }
}

/// Read the first message off the wire, sniffing whether the peer opened
/// with a `Content-Length:` header or a bare newline-delimited JSON line.
async fn read_first_message<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> anyhow::Result<Option<(Framing, String)>> {
    let mut first_line = String::new();
    if reader.read_line(&mut first_line).await? == 0 {
        return Ok(None);
    }
    let trimmed = first_line.trim_end_matches(['\r', '\n']);

    if trimmed.to_ascii_lowercase().starts_with(CONTENT_LENGTH_PREFIX) {
        let body = read_content_length_body(reader, trimmed).await?;
        return Ok(Some((Framing::ContentLength, body)));
    }
    Ok(Some((Framing::NewlineDelimited, trimmed.to_string())))
}

async fn read_newline_message<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> anyhow::Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn read_content_length_message<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> anyhow::Result<Option<String>> {
    let mut header_line = String::new();
    loop {
        header_line.clear();
        if reader.read_line(&mut header_line).await? == 0 {
            return Ok(None);
        }
        let trimmed = header_line.trim_end_matches(['\r', '\n']);
        if trimmed.to_ascii_lowercase().starts_with(CONTENT_LENGTH_PREFIX) {
            return Ok(Some(read_content_length_body(reader, trimmed).await?));
        }
        // Blank separator lines or unrecognised headers between frames are
        // skipped rather than treated as a protocol error.
    }
}

async fn read_content_length_body<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    header_line: &str,
) -> anyhow::Result<String> {
    let length: usize = header_line[CONTENT_LENGTH_PREFIX.len()..]
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("malformed Content-Length header: '{header_line}'"))?;

    // Consume the blank line separating headers from the body.
    let mut blank = String::new();
    reader.read_line(&mut blank).await?;

    let mut body = vec![0u8; length];
    tokio::io::AsyncReadExt::read_exact(reader, &mut body).await?;
    Ok(String::from_utf8(body)?)
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, value: &Value, content_length: bool) -> anyhow::Result<()> {
    let payload = serde_json::to_string(value)?;
    if content_length {
        writer
            .write_all(format!("Content-Length: {}\r\n\r\n", payload.len()).as_bytes())
            .await?;
        writer.write_all(payload.as_bytes()).await?;
    } else {
        writer.write_all(payload.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatago_config::HubConfig;
    use tokio::io::duplex;

    #[tokio::test]
    async fn newline_delimited_round_trip() -> anyhow::Result<()> {
        let hub = Arc::new(Hub::new(HubConfig::default(), None, false));
        let (mut client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);

        let task = tokio::spawn(serve(hub, server_read, server_write));

        client
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .await?;

        let mut reader = BufReader::new(&mut client);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let value: Value = serde_json::from_str(line.trim())?;
        assert_eq!(value["result"], json!({}));

        drop(client);
        let _ = task.await;
        Ok(())
    }

    #[tokio::test]
    async fn content_length_framing_is_detected_and_echoed() -> anyhow::Result<()> {
        let hub = Arc::new(Hub::new(HubConfig::default(), None, false));
        let (mut client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);

        let task = tokio::spawn(serve(hub, server_read, server_write));

        let body = "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}";
        client
            .write_all(format!("Content-Length: {}\r\n\r\n{body}", body.len()).as_bytes())
            .await?;

        let mut reader = BufReader::new(&mut client);
        let mut header = String::new();
        reader.read_line(&mut header).await?;
        assert!(header.to_ascii_lowercase().starts_with(CONTENT_LENGTH_PREFIX));
        let length: usize = header[CONTENT_LENGTH_PREFIX.len()..].trim().parse()?;

        let mut blank = String::new();
        reader.read_line(&mut blank).await?;

        let mut body_buf = vec![0u8; length];
        tokio::io::AsyncReadExt::read_exact(&mut reader, &mut body_buf).await?;
        let value: Value = serde_json::from_slice(&body_buf)?;
        assert_eq!(value["result"], json!({}));

        drop(client);
        let _ = task.await;
        Ok(())
    }
}

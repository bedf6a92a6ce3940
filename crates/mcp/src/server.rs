// Local MCP server over stdio (newline-delimited JSON)

use crate::framing::DEFAULT_MAX_MESSAGE_BYTES;
use crate::handler::McpHandler;
use crate::protocol::{JsonRpcError, JsonRpcResponse};
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

/// Connection id used for the single stdio session
pub const STDIO_CONNECTION: &str = "stdio";

pub struct McpServer {
    handler: Arc<McpHandler>,
}

impl McpServer {
    pub fn new(handler: Arc<McpHandler>) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &Arc<McpHandler> {
        &self.handler
    }

    /// Serve on the process's stdin/stdout until stdin closes
    pub async fn start(&self) -> Result<()> {
        tracing::info!(
            tools = self.handler.catalog().len(),
            "MCP server listening on stdio"
        );
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve one connection over a line-oriented byte stream
    ///
    /// End of input is a half-close: calls already running finish and their
    /// responses are written before the session closes.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.handler.open(STDIO_CONNECTION);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            let mut sink = FramedWrite::new(writer, LinesCodec::new());
            while let Some(line) = rx.recv().await {
                if let Err(e) = sink.send(line).await {
                    tracing::error!(error = %e, "Failed to write to stdout");
                    break;
                }
            }
        });

        let mut lines = FramedRead::new(
            reader,
            LinesCodec::new_with_max_length(DEFAULT_MAX_MESSAGE_BYTES),
        );
        let mut tasks = JoinSet::new();
        let mut read_error = None;

        while let Some(line) = lines.next().await {
            match line {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    let handler = self.handler.clone();
                    let tx = tx.clone();
                    tasks.spawn(async move {
                        if let Some(response) = handler.handle_text(STDIO_CONNECTION, &line).await {
                            let _ = tx.send(response.to_string());
                        }
                    });
                }
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!("Dropping oversized message");
                    let response = JsonRpcResponse::error(
                        serde_json::Value::Null,
                        JsonRpcError::parse_error("message too long"),
                    );
                    let _ = tx.send(response.into_value().to_string());
                }
                Err(LinesCodecError::Io(e)) => {
                    read_error = Some(e);
                    break;
                }
            }

            // reap finished calls so the set stays small
            while tasks.try_join_next().is_some() {}
        }

        while tasks.join_next().await.is_some() {}
        self.handler.close(STDIO_CONNECTION);

        drop(tx);
        writer_task.await.context("stdout writer task failed")?;

        tracing::info!("MCP stdio session ended");
        match read_error {
            Some(e) => Err(e).context("failed to read from stdin"),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use toolrelay_core::{Catalog, ToolExecutor};

    fn server() -> McpServer {
        let catalog = Catalog::from_toml_str(
            r#"
[[tools]]
name = "greet"
description = "Say hello"

[[tools.parameters]]
name = "who"
type = "string"
required = true

[tools.shell]
argv = ["echo", "hello {{who}}"]
"#,
        )
        .unwrap();
        McpServer::new(Arc::new(McpHandler::new(
            Arc::new(catalog),
            Arc::new(ToolExecutor::new()),
        )))
    }

    async fn run(input: &str) -> Vec<Value> {
        let (mut client_in, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, mut client_out) = tokio::io::duplex(64 * 1024);

        let server = server();
        let serving = tokio::spawn(async move { server.serve(server_in, server_out).await });

        client_in.write_all(input.as_bytes()).await.unwrap();
        drop(client_in);

        let mut output = String::new();
        client_out.read_to_string(&mut output).await.unwrap();
        serving.await.unwrap().unwrap();

        let mut responses: Vec<Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        responses.sort_by_key(|r| r["id"].as_i64().unwrap_or(-1));
        responses
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_session() {
        let input = [
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"protocolVersion": "2025-06-18"}}),
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        ]
        .iter()
        .map(|m| format!("{}\n", m))
        .collect::<String>();
        let responses = run(&input).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["result"]["protocolVersion"], "2025-06-18");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_skips_blank_lines_and_reports_garbage() {
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\"}\n",
            "\n",
            "not json\n",
        );
        let responses = run(input).await;
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[0]["error"]["data"]["kind"], "parse_error");
        assert!(responses[1]["result"].is_object());
    }

    #[tokio::test]
    async fn test_stdio_tools_call() {
        // initialize must land before the call, so feed them one at a time
        let (mut client_in, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_out) = tokio::io::duplex(64 * 1024);
        let server = server();
        let serving = tokio::spawn(async move { server.serve(server_in, server_out).await });

        let mut reader = FramedRead::new(client_out, LinesCodec::new());

        client_in
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\"}\n")
            .await
            .unwrap();
        let init: Value = serde_json::from_str(&reader.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(init["id"], 1);

        client_in
            .write_all(
                b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/call\",\"params\":{\"name\":\"greet\",\"arguments\":{\"who\":\"world\"}}}\n",
            )
            .await
            .unwrap();
        let call: Value = serde_json::from_str(&reader.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(call["id"], 2);
        if cfg!(unix) {
            assert_eq!(call["result"]["content"][0]["text"], "hello world\n");
        }

        drop(client_in);
        serving.await.unwrap().unwrap();
    }
}

//! Interactive chat loop over a loopback model.

use {
    async_trait::async_trait,
    parley_common::{ConversationContext, InMemoryContext},
    parley_plugins::{ModelClient, Outbox, Pipeline, TurnOutcome},
    serde_json::{Value, json},
    tokio::io::{AsyncBufReadExt, BufReader},
    tracing::warn,
};

use crate::extension_commands::{parse_params, print_result};

/// Model stand-in that answers with the latest user entry of the request.
pub struct LoopbackModel;

#[async_trait]
impl ModelClient for LoopbackModel {
    async fn complete(&self, request: &str) -> anyhow::Result<String> {
        let request: Value = serde_json::from_str(request)?;
        let last_user = request["messages"]
            .as_array()
            .and_then(|msgs| msgs.iter().rev().find(|m| m["role"] == "user"))
            .and_then(|m| m["content"].as_str())
            .unwrap_or_default();
        Ok(json!({
            "messages": [{"type": "text", "content": format!("You said: {last_user}"), "delay_ms": 0}]
        })
        .to_string())
    }
}

/// Outbox that prints to the terminal.
pub struct StdoutOutbox;

#[async_trait]
impl Outbox for StdoutOutbox {
    async fn send(&self, text: &str) -> anyhow::Result<bool> {
        println!("[outbox] {text}");
        Ok(true)
    }
}

pub async fn run_chat(pipeline: &Pipeline, source: &str) -> anyhow::Result<()> {
    let ctx = InMemoryContext::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    eprintln!("Type a message, /cmd <extension> <command> [key=value...], /history or /quit.");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_whitespace().next() {
            Some("/quit" | "/exit") => break,
            Some("/history") => {
                for m in ctx.messages() {
                    println!("{:>9}: {}", m.role.as_str(), m.content);
                }
            },
            Some("/cmd") => {
                let args: Vec<String> = line.split_whitespace().skip(1).map(str::to_string).collect();
                let [extension, command, params @ ..] = args.as_slice() else {
                    eprintln!("usage: /cmd <extension> <command> [key=value...]");
                    continue;
                };
                let result = pipeline
                    .host()
                    .execute(extension, command, &parse_params(params), &ctx)
                    .await;
                print_result(&result);
            },
            _ => match pipeline.submit(source, &[line], &ctx).await {
                Ok(TurnOutcome::Delivered(reply)) => println!("{reply}"),
                Ok(TurnOutcome::Intercepted(reply)) => println!("{reply}"),
                Err(e) => {
                    warn!(error = %e, "turn failed");
                    eprintln!("error: {e}");
                },
            },
        }
    }
    Ok(())
}

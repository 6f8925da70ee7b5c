//! CLI commands for extension inspection and command invocation.

use {
    parley_common::{InMemoryContext, hooks::HookPoint},
    parley_plugins::{CommandParams, CommandResult, ExtensionHost, Pipeline},
    serde_json::{Value, json},
};

/// Turn `key=value` arguments into command parameters. Values that parse as
/// JSON (numbers, booleans, arrays) keep their type; the rest are strings.
pub fn parse_params(args: &[String]) -> CommandParams {
    args.iter()
        .filter_map(|arg| arg.split_once('='))
        .map(|(key, raw)| {
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.into()));
            (key.to_string(), value)
        })
        .collect()
}

pub fn print_result(result: &CommandResult) {
    let status = if result.success {
        "ok"
    } else {
        "failed"
    };
    println!("[{status}] {}", result.message);
    if let Some(data) = &result.data {
        match serde_json::to_string_pretty(data) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{data}"),
        }
    }
}

pub async fn run_command(
    pipeline: &Pipeline,
    extension: &str,
    name: &str,
    args: &[String],
) -> anyhow::Result<()> {
    let ctx = InMemoryContext::new();
    let result = pipeline
        .host()
        .execute(extension, name, &parse_params(args), &ctx)
        .await;
    print_result(&result);
    if !result.success {
        anyhow::bail!("command {extension}/{name} failed");
    }
    Ok(())
}

pub fn list_extensions(host: &ExtensionHost, as_json: bool) -> anyhow::Result<()> {
    let extensions = host.extensions();

    if as_json {
        let points: serde_json::Map<String, Value> = HookPoint::ALL
            .iter()
            .map(|point| {
                let chain: Vec<Value> = host
                    .registry()
                    .handlers_at(*point)
                    .into_iter()
                    .map(|h| json!({"name": h.name, "priority": h.priority}))
                    .collect();
                (point.to_string(), Value::Array(chain))
            })
            .collect();
        let entries: Vec<Value> = extensions
            .iter()
            .map(|e| {
                json!({
                    "id": e.id,
                    "priority": e.priority,
                    "commands": e.commands.iter().map(|c| c.name).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({"extensions": entries, "points": points}))?
        );
        return Ok(());
    }

    if extensions.is_empty() {
        println!("No extensions registered.");
        return Ok(());
    }
    for e in &extensions {
        println!("  {} (priority {})", e.id, e.priority);
        for c in &e.commands {
            if c.usage.is_empty() {
                println!("    {:<16} {}", c.name, c.description);
            } else {
                println!("    {:<16} {} [{}]", c.name, c.description, c.usage);
            }
        }
    }
    println!();
    for point in HookPoint::ALL {
        let chain: Vec<String> = host
            .registry()
            .handlers_at(*point)
            .into_iter()
            .map(|h| format!("{}({})", h.name, h.priority))
            .collect();
        println!("  {:<16} {}", point.to_string(), chain.join(" -> "));
    }
    Ok(())
}

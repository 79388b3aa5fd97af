//! Inspect and manage the server queue and history.
//!
//! ```sh
//! cargo run --example queue_management
//! ```

use comfyui_client::ComfyClient;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let client = ComfyClient::new("http://127.0.0.1:8188");

    let stats = client.system_stats().await?;
    println!("{} / python {}", stats.system.os, stats.system.python_version);
    for device in &stats.devices {
        println!(
            "  {} ({}): {} MiB free of {} MiB",
            device.name,
            device.device_type,
            device.vram_free / (1024 * 1024),
            device.vram_total / (1024 * 1024)
        );
    }

    let queue = client.queue().await?;
    println!(
        "\nQueue: {} running, {} pending",
        queue.running_count(),
        queue.pending_count()
    );
    for record in queue.running.iter().chain(&queue.pending) {
        println!(
            "  #{} {} ({} nodes)",
            record.number,
            record.prompt_id,
            record.workflow.len()
        );
    }

    let history = client.history(None).await?;
    println!("\nHistory: {} prompt(s)", history.len());
    for (prompt_id, entry) in &history {
        let outcome = match entry.status.execution_error() {
            Some(err) => format!("failed: {}", err.exception_message),
            None => entry.status.status_str.clone(),
        };
        println!("  {} {} image(s), {}", prompt_id, entry.images().len(), outcome);
    }

    let loras = client.models(Some("loras")).await?;
    println!("\nLoRAs ({}):", loras.len());
    for lora in &loras {
        println!("  - {}", lora);
    }

    Ok(())
}

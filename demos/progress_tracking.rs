//! Track several prompts over one event-stream connection.
//!
//! Submits two generations back to back and waits for both concurrently,
//! printing step progress and ETA as events arrive.
//!
//! ```sh
//! RUST_LOG=comfyui_client=debug cargo run --example progress_tracking
//! ```

use comfyui_client::{ComfyClient, ComfyError, ProgressState, Txt2ImgRequest, WaitOptions};
use std::time::Duration;

fn report(label: &str, p: &ProgressState) {
    let eta = p
        .eta()
        .map(|d| format!("{:.0}s", d.as_secs_f64()))
        .unwrap_or_else(|| "?".into());
    println!(
        "  [{}] {:?} node={} step {}/{} ({:.0}%) eta {}",
        label,
        p.state,
        p.current_node.as_deref().unwrap_or("-"),
        p.current_step,
        p.total_steps,
        p.percentage(),
        eta
    );
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let client = ComfyClient::new("http://127.0.0.1:8188");

    let checkpoints = client.checkpoints().await?;
    let Some(checkpoint) = checkpoints.first() else {
        eprintln!("No checkpoints found");
        return Ok(());
    };

    // Subscribe before submitting so no early event is missed.
    let events = client.connect_events().await?;

    let (cat, _) = Txt2ImgRequest::new("a cat wearing a tiny hat, digital art", checkpoint)
        .steps(30)
        .build()?;
    let (dog, _) = Txt2ImgRequest::new("a dog in a spacesuit, digital art", checkpoint)
        .steps(20)
        .build()?;

    let first = client.submit(&cat, None).await?;
    let second = client.submit(&dog, None).await?;
    println!("Queued {} and {}", first.prompt_id, second.prompt_id);

    let opts = WaitOptions::new().with_timeout(Duration::from_secs(600));
    let (a, b) = tokio::join!(
        client.wait_for_completion(&events, &first.prompt_id, opts.clone(), |p| report("cat", p)),
        client.wait_for_completion(&events, &second.prompt_id, opts, |p| report("dog", p)),
    );

    for (label, result) in [("cat", a), ("dog", b)] {
        match result {
            Ok(r) => println!("{}: {} image(s) in {:.1}s", label, r.images.len(), r.duration.as_secs_f64()),
            Err(ComfyError::Execution(e)) => {
                eprintln!("{}: failed in {} ({}): {}", label, e.node_id, e.node_type, e.exception_message)
            }
            Err(e) => eprintln!("{}: {}", label, e),
        }
    }

    events.close();
    Ok(())
}

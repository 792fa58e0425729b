use serde::Serialize;
use std::error::Error;
use std::sync::Arc;
use tokio::time::{Duration, sleep};
use tracing::info;

use spool_core::observability::init_tracing;
use spool_core::{Process, ProcessError, TaskConfig, TaskContext, TaskId, TaskManager};

/// Demo episode: a few progress steps, then a result (or a failure).
fn ingest_episode(body: &'static str, steps: u32, fail_at: Option<u32>) -> impl Process {
    move |ctx: TaskContext| async move {
        for step in 1..=steps {
            if ctx.is_cancelled().await {
                return Err(ProcessError::Cancelled);
            }
            if fail_at == Some(step) {
                return Err(ProcessError::failed(format!(
                    "entity extraction failed at step {step}"
                )));
            }
            sleep(Duration::from_millis(200)).await;
            ctx.report_progress((step * 100 / steps) as i32).await;
        }
        ctx.set_result(serde_json::json!({
            "episode": body,
            "nodes": body.split_whitespace().count(),
        }))
        .await;
        Ok(())
    }
}

fn print_json<T: Serialize>(label: &str, value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{label}:\n{json}"),
        Err(e) => println!("{label}: <unserializable: {e}>"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    // (A) 設定を読んで manager を起動（不正値は default に戻る）
    let config = TaskConfig::from_env();
    let manager = Arc::new(TaskManager::new(config));
    manager.start().await;

    // (B) partition ごとに episode を投入
    let episodes: [(&str, &'static str, u32, Option<u32>); 5] = [
        ("alpha", "alice met bob at the lab", 3, None),
        ("alpha", "bob shipped the parser", 2, None),
        ("beta", "carol reviewed the budget", 4, Some(3)),
        ("beta", "dave joined the team", 2, None),
        ("gamma", "erin wrote the release notes", 3, None),
    ];

    let mut ids: Vec<TaskId> = Vec::new();
    for (n, (partition, body, steps, fail_at)) in episodes.into_iter().enumerate() {
        let submission = manager
            .submit_task(
                &format!("episode-{n}"),
                partition,
                ingest_episode(body, steps, fail_at),
            )
            .await?;
        print_json("submitted", &submission);
        ids.push(submission.task_id);
    }

    // (C) 一件キャンセル（まだ queue にあれば実行されない）
    if let Some(last) = ids.last() {
        let outcome = manager.cancel_task(last).await?;
        println!("{}", outcome.message());
    }

    // (D) 終わるまで待って結果を表示
    for id in &ids {
        let outcome = manager.wait_for_task(id, Duration::from_secs(30)).await?;
        info!(task_id = %id, waited_ms = outcome.waited.as_millis() as u64, "task finished");
        print_json("record", &outcome.record);
    }

    // (E) sync モード: queue を通さずその場で実行
    let inline = manager
        .run_inline("episode-inline", "alpha", ingest_episode("inline run", 1, None))
        .await?;
    print_json("inline", &inline);

    // (F) 統計と失敗一覧
    print_json("stats", &manager.stats().await);
    let failed = manager.list_tasks(None, Some("failed"), 10).await?;
    println!("failed tasks: {}", failed.len());
    for partition in manager.partitions() {
        if let Some(snapshot) = manager.partition_snapshot(&partition) {
            print_json("partition", &snapshot);
        }
    }

    manager.shutdown().await;
    Ok(())
}

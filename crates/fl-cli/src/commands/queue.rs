//! Read-side commands plus the operator unblock pass.

use std::str::FromStr;

use clap::Args;
use fl_core::task_store::{QueueFilter, QueueSnapshot, TaskStore, UnblockReport};
use fl_core::types::{FeedbackMessage, TaskStatus};

#[derive(Debug, Args)]
pub struct QueueArgs {
    #[arg(long, value_parser = TaskStatus::from_str)]
    pub status: Option<TaskStatus>,
    #[arg(long)]
    pub assigned_to: Option<String>,
    #[arg(long = "type")]
    pub task_type: Option<String>,
    /// Print only the counts by status.
    #[arg(long)]
    pub counts: bool,
}

pub async fn queue(store: &TaskStore, args: QueueArgs) -> anyhow::Result<QueueSnapshot> {
    let filter = QueueFilter {
        status: args.status,
        assigned_to: args.assigned_to,
        task_type: args.task_type,
    };
    let mut snapshot = store.get_queue(filter).await?;
    if args.counts {
        snapshot.tasks.clear();
    }
    Ok(snapshot)
}

/// With a key, promote dependents of that task; without, re-scan every
/// blocked task.
pub async fn unblock(store: &TaskStore, key: Option<&str>) -> anyhow::Result<UnblockReport> {
    let report = match key {
        Some(key) => store.unblock_cascade(key).await?,
        None => store.unblock_all().await?,
    };
    if !report.cycles.is_empty() {
        tracing::warn!(cycles = ?report.cycles, "dependency cycles skipped");
    }
    Ok(report)
}

#[derive(Debug, Args)]
pub struct MessagesArgs {
    /// Messages addressed to this receiver (broadcasts included).
    #[arg(long, conflicts_with = "about")]
    pub to: Option<String>,
    /// Messages about this task key.
    #[arg(long)]
    pub about: Option<String>,
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}

pub async fn messages(
    store: &TaskStore,
    args: MessagesArgs,
) -> anyhow::Result<Vec<FeedbackMessage>> {
    let mut messages = match (args.about, args.to) {
        (Some(key), _) => store.messages_about(&key).await?,
        (None, Some(receiver)) => store.messages_for(&receiver, args.limit).await?,
        (None, None) => store.messages_for(store.supervisor(), args.limit).await?,
    };
    messages.truncate(args.limit);
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fl_core::types::{MessageType, NewTask};

    #[tokio::test]
    async fn counts_only_drops_the_task_list() {
        let store = TaskStore::open_in_memory().await.unwrap();
        let first = store.create_task(NewTask::new("a")).await.unwrap();
        store
            .create_task(NewTask::new("b").depends_on([first.key.clone()]))
            .await
            .unwrap();

        let snapshot = queue(
            &store,
            QueueArgs {
                status: None,
                assigned_to: None,
                task_type: None,
                counts: true,
            },
        )
        .await
        .unwrap();
        assert!(snapshot.tasks.is_empty());
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.counts_by_status.get(&TaskStatus::Blocked), Some(&1));
    }

    #[tokio::test]
    async fn unblock_all_on_an_empty_queue() {
        let store = TaskStore::open_in_memory().await.unwrap();
        let report = unblock(&store, None).await.unwrap();
        assert!(report.promoted.is_empty());
        assert!(report.trigger.is_none());
    }

    #[tokio::test]
    async fn messages_about_a_task() {
        let store = TaskStore::open_in_memory().await.unwrap();
        let task = store.create_task(NewTask::new("a")).await.unwrap();
        let found = messages(
            &store,
            MessagesArgs {
                to: None,
                about: Some(task.key.clone()),
                limit: 10,
            },
        )
        .await
        .unwrap();
        assert!(found
            .iter()
            .any(|m| m.message_type == MessageType::TaskCreated));
    }
}

use async_trait::async_trait;
use bytes::Bytes;
use gigi_archive::{
    AlertContent, AlertSink, Archive, ArchiveConfig, ContentPart, DeletionAlert, ExtendedText,
    MediaFetcher, MediaPayload, MessageKind, ProtocolPayload, ProtocolType, RawMessage,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Pretends to download every attachment
struct StaticFetcher;

#[async_trait]
impl MediaFetcher for StaticFetcher {
    async fn fetch(&self, message: &RawMessage, kind: MessageKind) -> anyhow::Result<Bytes> {
        Ok(Bytes::from(format!("{:?} attachment of {}", kind, message.id)))
    }
}

/// Prints alerts instead of sending them to a chat
struct PrintSink;

#[async_trait]
impl AlertSink for PrintSink {
    async fn deliver(&self, alert: DeletionAlert) -> anyhow::Result<()> {
        match alert.content {
            AlertContent::Recovered { record, media_path } => {
                println!(
                    "🗑  {} deleted in {}: {:?}",
                    record.sender_id, alert.chat_id, record.text_content
                );
                if let Some(path) = media_path {
                    println!("    media: {}", path.display());
                }
            }
            AlertContent::Unrecoverable => {
                println!(
                    "🗑  message {} deleted in {} (content unavailable)",
                    alert.message_id, alert.chat_id
                );
            }
        }
        Ok(())
    }
}

fn message(id: &str, content: Vec<ContentPart>) -> RawMessage {
    RawMessage {
        id: id.to_string(),
        chat_id: "120363041234567890@g.us".to_string(),
        sender_id: "15550002222@s.whatsapp.net".to_string(),
        participant_id: None,
        from_self: false,
        timestamp: chrono::Utc::now().timestamp(),
        is_business: false,
        content,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Optional config file as the first argument
    let data_dir = tempfile::tempdir()?;
    let mut config = match std::env::args().nth(1) {
        Some(path) => ArchiveConfig::from_json_file(&PathBuf::from(path))?,
        None => ArchiveConfig::default(),
    };
    config.data_dir = data_dir.path().to_path_buf();
    config.settle_delay_ms = 200;
    config.retry_delay_ms = 500;

    let archive = Archive::open(config, Arc::new(StaticFetcher), Arc::new(PrintSink)).await?;
    archive.start_retention();

    archive.ingest(&message(
        "A",
        vec![ContentPart::Conversation {
            text: "hello world".to_string(),
        }],
    ));
    archive.ingest(&message(
        "P",
        vec![ContentPart::Image(MediaPayload {
            mime_type: Some("image/jpeg".to_string()),
            caption: Some("holiday".to_string()),
            ..Default::default()
        })],
    ));

    let edit = archive.ingest(&message(
        "B",
        vec![ContentPart::Edited {
            content: vec![ContentPart::ExtendedText(ExtendedText {
                text: "hello universe".to_string(),
                context: None,
            })],
        }],
    ));
    if let Some(mapping) = edit.edit {
        println!("✏️  {} is an edit of {}", mapping.edited_id, mapping.original_id);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;

    for target in ["P", "never-seen"] {
        let revoke = archive.ingest(&message(
            &format!("revoke-{}", target),
            vec![ContentPart::Protocol(ProtocolPayload {
                protocol_type: ProtocolType::Numeric(0),
                target_id: Some(target.to_string()),
                target_chat_id: None,
            })],
        ));
        if let Some(signal) = revoke.deletion {
            let outcome = archive.handle_deletion(signal).await;
            println!("   outcome: {:?}", outcome);
        }
    }

    if let Some(report) = archive.sweep().await {
        println!("Sweep cleaned {} items", report.total_cleaned());
    }
    archive.shutdown(Duration::from_secs(5)).await;
    Ok(())
}

//! Producer/consumer demo: enqueue a handful of emails, some delayed,
//! and run a container that sends them until ctrl-c.

use log::info;
use redqueue::prelude::*;
use std::time::Duration;

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
struct Email {
    to: String,
    body: String,
}

async fn produce(template: &MessageTemplate<Email>, keys: &redqueue::keys::QueueKeys) {
    for i in 0..5 {
        let email = Email {
            to: format!("user{i}@example.com"),
            body: "Welcome to redqueue".to_string(),
        };
        template.enqueue(keys, &email, 0).await.expect("enqueue");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // One delayed message, due five seconds from now.
    let later = chrono::Utc::now().timestamp_millis() + 5_000;
    template
        .enqueue(
            keys,
            &Email {
                to: "late@example.com".to_string(),
                body: "This one waited".to_string(),
            },
            later,
        )
        .await
        .expect("enqueue delayed");
}

async fn send_email(msg: Message<Email>) -> Result<(), Error> {
    info!("sending to {} ({})", msg.payload.to, msg.payload.body);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let conn = redqueue::connect("redis://127.0.0.1").await?;
    let keys = redqueue::keys::QueueKeys::new("emails");
    let producer_template = MessageTemplate::new(conn.clone(), Default::default());
    produce(&producer_template, &keys).await;

    let container: Container<Email> = Container::builder(conn)
        .register(
            MappingInfo::new("emails")
                .delayed(true)
                .num_retries(3)
                .dead_letter_queue("emails_dlq")
                .max_job_execution_time_ms(30_000),
            send_email,
        )?
        .build()?;

    container.start().await?;
    tokio::signal::ctrl_c().await?;
    container.stop().await?;
    Ok(())
}

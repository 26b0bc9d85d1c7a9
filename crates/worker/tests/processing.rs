//! Worker processors driven through the producer and dispatcher, with fake collaborators.

use std::sync::{Arc, Mutex};

use serde_json::json;
use uuid::Uuid;

use courier_infra::jobs::{
    Dispatcher, HistoryStatus, HistoryStore, ProcessOutcome, QueueStore, SubmitError,
};
use courier_worker::app::App;
use courier_worker::config::WorkerConfig;
use courier_worker::payloads::{
    CreateUserJob, PasswordResetEmailJob, WelcomeEmailJob, EMAIL_QUEUE, USER_SYNC_QUEUE,
};
use courier_worker::processors::build_registry;
use courier_worker::services::{
    DeliveryError, EmailMessage, EmailSender, RemoteError, UserSyncTarget,
};

#[derive(Default)]
struct FakeSender {
    sent: Mutex<Vec<EmailMessage>>,
    fail_with: Option<DeliveryError>,
}

#[async_trait::async_trait]
impl EmailSender for FakeSender {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[derive(Default)]
struct FakeBackend {
    created: Mutex<Vec<(Uuid, String, String)>>,
    status: Option<u16>,
}

#[async_trait::async_trait]
impl UserSyncTarget for FakeBackend {
    async fn create_user(&self, id: Uuid, name: &str, email: &str) -> Result<(), RemoteError> {
        if let Some(status) = self.status {
            return Err(RemoteError::Status { status });
        }
        self.created
            .lock()
            .unwrap()
            .push((id, name.to_string(), email.to_string()));
        Ok(())
    }
}

fn app(app_env: &str) -> App {
    let app_env = app_env.to_string();
    let config = WorkerConfig::from_lookup(|key| (key == "APP_ENV").then(|| app_env.clone())).unwrap();
    App::in_memory(config)
}

fn dispatcher(
    app: &App,
    sender: Arc<FakeSender>,
    backend: Arc<FakeBackend>,
) -> Dispatcher<Arc<dyn QueueStore>, Arc<dyn HistoryStore>> {
    let registry = build_registry(sender, backend, app.config.soft_fail_unauthorized());
    Dispatcher::new(
        app.store.clone(),
        app.history.clone(),
        app.catalog.clone(),
        registry,
    )
    .unwrap()
}

#[tokio::test]
async fn welcome_email_is_rendered_and_sent() {
    let app = app("development");
    let sender = Arc::new(FakeSender::default());
    let dispatcher = dispatcher(&app, sender.clone(), Arc::default());

    let job_id = app
        .producer()
        .submit_typed(
            &WelcomeEmailJob {
                email: "ada@example.com".into(),
                name: "Ada".into(),
                history_id: None,
            },
            None,
        )
        .await
        .unwrap();

    let outcome = dispatcher.process_next(EMAIL_QUEUE).await.unwrap().unwrap();
    assert_eq!(outcome.job_id(), job_id);
    assert!(matches!(outcome, ProcessOutcome::Completed { .. }));

    let sent = sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "ada@example.com");
    assert!(sent[0].text_content.as_deref().unwrap().contains("Hello Ada!"));

    let job = app.store.get(EMAIL_QUEUE, job_id).await.unwrap().unwrap();
    let record = app.history.get(job.history_id().unwrap()).await.unwrap().unwrap();
    assert_eq!(record.status, HistoryStatus::Completed);
    assert_eq!(record.attempts, 1);
}

#[tokio::test]
async fn password_reset_links_to_frontend() {
    let app = app("development");
    let sender = Arc::new(FakeSender::default());
    let dispatcher = dispatcher(&app, sender.clone(), Arc::default());

    app.producer()
        .submit_typed(
            &PasswordResetEmailJob {
                email: "grace@example.com".into(),
                reset_token: "tok123".into(),
                frontend_url: "https://app.example.com".into(),
                history_id: None,
            },
            None,
        )
        .await
        .unwrap();
    dispatcher.process_next(EMAIL_QUEUE).await.unwrap().unwrap();

    let sent = sender.sent.lock().unwrap();
    let text = sent[0].text_content.as_deref().unwrap();
    assert!(text.contains("https://app.example.com/auth/reset-password?token=tok123"));
    assert!(text.contains("Hello grace,"));
}

#[tokio::test]
async fn unauthorized_welcome_email_soft_succeeds_outside_production() {
    let app = app("development");
    let sender = Arc::new(FakeSender {
        fail_with: Some(DeliveryError::Unauthorized { status: 401 }),
        ..FakeSender::default()
    });
    let dispatcher = dispatcher(&app, sender, Arc::default());

    app.producer()
        .submit(EMAIL_QUEUE, "welcome-email", json!({"email": "a@example.com", "name": "A"}), None)
        .await
        .unwrap();

    match dispatcher.process_next(EMAIL_QUEUE).await.unwrap().unwrap() {
        ProcessOutcome::Completed { result, .. } => {
            assert_eq!(result, Some(json!({"skipped": "unauthorized"})))
        }
        other => panic!("expected soft success, got {other:?}"),
    }
}

#[tokio::test]
async fn unauthorized_welcome_email_retries_in_production() {
    let app = app("production");
    let sender = Arc::new(FakeSender {
        fail_with: Some(DeliveryError::Unauthorized { status: 401 }),
        ..FakeSender::default()
    });
    let dispatcher = dispatcher(&app, sender, Arc::default());

    app.producer()
        .submit(EMAIL_QUEUE, "welcome-email", json!({"email": "a@example.com", "name": "A"}), None)
        .await
        .unwrap();

    let outcome = dispatcher.process_next(EMAIL_QUEUE).await.unwrap().unwrap();
    assert!(matches!(outcome, ProcessOutcome::Retrying { attempts_made: 1, .. }));
}

#[tokio::test]
async fn create_user_is_synced_and_remote_errors_retry() {
    let app = app("development");
    let backend = Arc::new(FakeBackend::default());
    let dispatcher = dispatcher(&app, Arc::default(), backend.clone());
    let id = Uuid::now_v7();

    app.producer()
        .submit_typed(
            &CreateUserJob {
                id,
                name: "Ada".into(),
                email: "ada@example.com".into(),
                history_id: None,
            },
            None,
        )
        .await
        .unwrap();
    let outcome = dispatcher.process_next(USER_SYNC_QUEUE).await.unwrap().unwrap();
    assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
    assert_eq!(
        backend.created.lock().unwrap().as_slice(),
        &[(id, "Ada".to_string(), "ada@example.com".to_string())]
    );

    let failing = Arc::new(FakeBackend {
        status: Some(500),
        ..FakeBackend::default()
    });
    let dispatcher = self::dispatcher(&app, Arc::default(), failing);
    app.producer()
        .submit(
            USER_SYNC_QUEUE,
            "create-user",
            json!({"id": Uuid::now_v7(), "name": "Bob", "email": "bob@example.com"}),
            None,
        )
        .await
        .unwrap();
    let outcome = dispatcher.process_next(USER_SYNC_QUEUE).await.unwrap().unwrap();
    assert!(matches!(outcome, ProcessOutcome::Retrying { .. }));
}

#[tokio::test]
async fn invalid_payload_is_rejected_before_enqueue() {
    let app = app("development");

    let err = app
        .producer()
        .submit(EMAIL_QUEUE, "welcome-email", json!({"email": "not-an-email", "name": "A"}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Validation(_)));

    let stats = app.admin().stats(EMAIL_QUEUE).await.unwrap();
    assert_eq!(stats.waiting, 0);
}

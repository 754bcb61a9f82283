// tests/pipeline_tests.rs

mod common;

use std::time::Duration;

use common::{QSTASH_NEXT_KEY, generation, qstash_signature, spawn_app, spawn_app_with, test_config};
use quizforge::{
    ports::CompletionError,
    services::{
        chunking::ChunkIterator,
        pipeline::{ChunkJob, COMPLETION_FAILED, UNREADABLE_RESPONSE},
    },
    store::Repository,
};
use serde_json::{Value, json};

#[tokio::test]
async fn short_document_is_ready_after_one_delivery() {
    // Arrange
    let app = spawn_app().await;
    let token = app.sign_in("reader@example.com").await;
    app.buy_tokens("reader@example.com", 3).await;
    let id = app.seed_card_set("The heart pumps blood.", Some("reader@example.com")).await;

    // Act
    let prepared: Value = app.prepare(&id, Some(&token)).await.json().await.unwrap();
    let deliveries = app.drain_jobs().await;

    // Assert
    assert_eq!(prepared, json!({ "success": true, "usedTokens": 1 }));
    assert_eq!(deliveries, 1);

    let view = app.get_card_set(&id, Some(&token)).await;
    assert_eq!(view["status"], "READY");
    assert_eq!(view["questions"].as_array().unwrap().len(), 2);

    let user = app.user("reader@example.com").await;
    assert_eq!(app.repo.available_token_count(&user.id).await.unwrap(), 2);
    assert_eq!(app.repo.redeemed_token_count(&id).await.unwrap(), 1);
}

#[tokio::test]
async fn long_document_walks_every_chunk_in_order() {
    // Arrange
    let app = spawn_app().await;
    let source = "cell ".repeat(4000);
    let id = app.seed_card_set(&source, None).await;
    app.prepare(&id, None).await;

    // Act
    let deliveries = app.drain_jobs().await;

    // Assert: 6144 + 3 * 5120 covers 20000 chars
    assert_eq!(deliveries, 4);

    let prompts = app.completion.prompts.lock().await.clone();
    assert_eq!(prompts.len(), 4);
    // Every chunk after the first carries the previous tail
    assert!(!prompts[0].contains("tail"));
    assert!(prompts[1..].iter().all(|p| p.contains("tail")));

    let questions = app.repo.list_questions(&id).await.unwrap();
    assert_eq!(questions.len(), 8);
    let starts: Vec<i32> = questions.iter().map(|q| q.question.chunk_start).collect();
    assert_eq!(starts, vec![0, 0, 6144, 6144, 11264, 11264, 16384, 16384]);

    assert_eq!(app.get_card_set(&id, None).await["status"], "READY");
}

#[tokio::test]
async fn overloaded_completion_is_retried_later() {
    // Arrange
    let app = spawn_app().await;
    let id = app.seed_card_set("Enzymes speed up reactions.", None).await;
    app.prepare(&id, None).await;
    app.completion.push(Err(CompletionError::Overloaded)).await;
    let first = app.scheduler.take().await.remove(0);

    // Act
    let response = app.deliver_body(&first.body.to_string()).await;

    // Assert
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "success": true, "delayed": true }));

    let retried = app.scheduler.published.lock().await.clone();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].body, first.body);
    assert_eq!(retried[0].delay, Some(Duration::from_secs(5)));
    assert_eq!(app.get_card_set(&id, None).await["status"], "PREPARING");

    // The retry succeeds
    app.drain_jobs().await;
    assert_eq!(app.get_card_set(&id, None).await["status"], "READY");
}

#[tokio::test]
async fn unreadable_completion_fails_the_set_and_releases_tokens() {
    // Arrange
    let app = spawn_app().await;
    let token = app.sign_in("buyer@example.com").await;
    app.buy_tokens("buyer@example.com", 1).await;
    let id = app.seed_card_set("Some text.", Some("buyer@example.com")).await;
    app.prepare(&id, Some(&token)).await;
    app.completion.push(Ok("this is not json".to_string())).await;

    let user = app.user("buyer@example.com").await;
    assert_eq!(app.repo.available_token_count(&user.id).await.unwrap(), 0);

    // Act
    let job = app.scheduler.take().await.remove(0);
    let response = app.deliver_body(&job.body.to_string()).await;

    // Assert: acknowledged so it is not redelivered
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "success": false, "error": UNREADABLE_RESPONSE }));

    let view = app.get_card_set(&id, Some(&token)).await;
    assert_eq!(view["status"], "ERROR");
    assert_eq!(view["error"], UNREADABLE_RESPONSE);
    assert_eq!(app.repo.available_token_count(&user.id).await.unwrap(), 1);
    assert!(app.repo.list_questions(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn out_of_range_answer_rejects_the_whole_batch() {
    // Arrange
    let app = spawn_app().await;
    let id = app.seed_card_set("Some text.", None).await;
    app.prepare(&id, None).await;
    app.completion
        .push(Ok(json!({
            "d": [
                { "q": "fine", "o": ["a", "b"], "a": 1 },
                { "q": "broken", "o": ["a", "b"], "a": 2 }
            ]
        })
        .to_string()))
        .await;

    // Act
    app.drain_jobs().await;

    // Assert
    assert_eq!(app.get_card_set(&id, None).await["status"], "ERROR");
    assert!(app.repo.list_questions(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_completion_fails_the_set() {
    // Arrange
    let app = spawn_app().await;
    let id = app.seed_card_set("Some text.", None).await;
    app.prepare(&id, None).await;
    app.completion
        .push(Err(CompletionError::Failed("401 Unauthorized".to_string())))
        .await;

    // Act
    app.drain_jobs().await;

    // Assert
    let view = app.get_card_set(&id, None).await;
    assert_eq!(view["status"], "ERROR");
    assert_eq!(view["error"], COMPLETION_FAILED);
}

#[tokio::test]
async fn duplicate_delivery_does_not_regenerate() {
    // Arrange
    let app = spawn_app().await;
    let id = app.seed_card_set(&"a".repeat(10_000), None).await;
    app.prepare(&id, None).await;
    let first = app.scheduler.take().await.remove(0);

    let response = app.deliver_body(&first.body.to_string()).await;
    assert_eq!(response.status().as_u16(), 200);
    let continuation = app.scheduler.take().await;
    assert_eq!(continuation.len(), 1);

    // Act: the scheduler delivers the first job again
    let response = app.deliver_body(&first.body.to_string()).await;

    // Assert
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(app.completion.prompts.lock().await.len(), 1);
    assert_eq!(app.repo.list_questions(&id).await.unwrap().len(), 2);

    // The same continuation is scheduled again
    let resumed = app.scheduler.take().await;
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].body, continuation[0].body);
    assert_eq!(resumed[0].body["iterator"]["lastIndex"], 6144);
    assert_eq!(resumed[0].body["iterator"]["incompleteChunk"], "tail");
}

#[tokio::test]
async fn delivery_for_a_finished_set_is_rejected() {
    // Arrange
    let app = spawn_app().await;
    let id = app.seed_card_set("Done.", None).await;
    app.prepare(&id, None).await;
    app.drain_jobs().await;

    // Act
    let response = app.deliver(&ChunkJob::first(&id)).await;

    // Assert
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn delivery_past_the_storable_offset_is_rejected() {
    // Arrange
    let app = spawn_app().await;
    let id = app.seed_card_set("Short text.", None).await;
    app.prepare(&id, None).await;
    app.scheduler.take().await;
    let job = ChunkJob {
        card_set_id: id.clone(),
        iterator: Some(ChunkIterator {
            last_index: i32::MAX as usize + 1,
            incomplete_chunk: String::new(),
        }),
    };

    // Act
    let response = app.deliver(&job).await;

    // Assert
    assert_eq!(response.status().as_u16(), 400);
    assert!(app.completion.prompts.lock().await.is_empty());
    assert_eq!(app.get_card_set(&id, None).await["status"], "PREPARING");
}

#[tokio::test]
async fn delivery_for_an_unknown_set_is_404() {
    // Arrange
    let app = spawn_app().await;

    // Act
    let response = app.deliver(&ChunkJob::first("missing")).await;

    // Assert
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn unsigned_or_tampered_deliveries_are_rejected() {
    // Arrange
    let app = spawn_app().await;
    let id = app.seed_card_set("Text.", None).await;
    let body = serde_json::to_string(&ChunkJob::first(&id)).unwrap();
    let url = app.url("/api/webhooks/question-builder");

    // Act
    let unsigned = app.client.post(&url).body(body.clone()).send().await.unwrap();
    let wrong_key = app
        .client
        .post(&url)
        .header("Upstash-Signature", qstash_signature(&body, "someone-else"))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    let tampered = app
        .client
        .post(&url)
        .header("Upstash-Signature", qstash_signature("{}", common::QSTASH_CURRENT_KEY))
        .body(body.clone())
        .send()
        .await
        .unwrap();

    // Assert
    assert_eq!(unsigned.status().as_u16(), 400);
    assert_eq!(wrong_key.status().as_u16(), 400);
    assert_eq!(tampered.status().as_u16(), 400);
    assert!(app.completion.prompts.lock().await.is_empty());
}

#[tokio::test]
async fn next_signing_key_is_accepted() {
    // Arrange
    let app = spawn_app().await;
    let id = app.seed_card_set("Text.", None).await;
    app.prepare(&id, None).await;
    app.scheduler.take().await;
    let body = serde_json::to_string(&ChunkJob::first(&id)).unwrap();

    // Act
    let response = app
        .client
        .post(app.url("/api/webhooks/question-builder"))
        .header("Upstash-Signature", qstash_signature(&body, QSTASH_NEXT_KEY))
        .body(body)
        .send()
        .await
        .unwrap();

    // Assert
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(app.get_card_set(&id, None).await["status"], "READY");
}

#[tokio::test]
async fn locked_preview_hides_questions_until_unlocked() {
    // Arrange
    let mut config = test_config();
    config.lock_preview_questions = true;
    config.free_preview_questions = 1;
    let app = spawn_app_with(config).await;

    let id = app.seed_card_set("Free text.", None).await;
    app.completion.push(Ok(generation(3, None))).await;
    app.prepare(&id, None).await;
    app.drain_jobs().await;

    // Act
    let locked = app.get_card_set(&id, None).await;

    // Assert
    assert_eq!(locked["isLocked"], true);
    assert_eq!(locked["questions"][0]["text"], "Question 1");
    assert_eq!(locked["questions"][1]["text"], "[LOCKED]");
    assert_eq!(locked["questions"][2]["options"][0]["text"], "[LOCKED]");

    let token = app.sign_in("fan@example.com").await;
    app.buy_tokens("fan@example.com", 1).await;
    let unlocked: Value = app
        .client
        .post(app.url(&format!("/api/card-sets/{}/unlock", id)))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(unlocked["success"], true);

    let view = app.get_card_set(&id, Some(&token)).await;
    assert_eq!(view["isLocked"], false);
    assert_eq!(view["questions"][2]["text"], "Question 3");
}

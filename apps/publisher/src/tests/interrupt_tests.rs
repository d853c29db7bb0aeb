use super::*;

use std::time::Duration;

use anyhow::anyhow;

#[tokio::test]
async fn interrupt_wins_over_a_blocked_prompt() {
    let blocked = std::future::pending::<Result<String>>();
    let answer = until_interrupted(blocked, async {}).await.expect("no error");
    assert_eq!(answer, None);
}

#[tokio::test]
async fn answer_is_returned_when_no_interrupt_arrives() {
    let answer = until_interrupted(
        async { Ok("y".to_string()) },
        std::future::pending::<()>(),
    )
    .await
    .expect("answer");
    assert_eq!(answer.as_deref(), Some("y"));
}

#[tokio::test]
async fn prompt_errors_still_propagate() {
    let err = until_interrupted(
        async { Err::<String, _>(anyhow!("stdin closed")) },
        tokio::time::sleep(Duration::from_secs(5)),
    )
    .await
    .expect_err("read failure");
    assert!(err.to_string().contains("stdin closed"));
}

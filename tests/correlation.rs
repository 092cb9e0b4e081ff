mod common;

use std::time::Duration;

use common::*;
use pretty_assertions::assert_eq;
use serial_tether::error::Error;

#[tokio::test]
async fn tracked_command_resolves_with_its_payload() {
    let (harness, mut device) = connected(test_config()).await;

    let task = {
        let session = harness.session.clone();
        tokio::spawn(async move { session.send("km.move(10,5)").await })
    };

    let command = answer_tracked(&mut device, "ok").await;

    assert_eq!(command, "km.move(10,5)");
    assert_eq!(task.await.unwrap().unwrap(), "ok");
}

#[tokio::test]
async fn untracked_command_resolves_with_the_next_plain_line() {
    let (harness, mut device) = connected(test_config()).await;

    let task = {
        let session = harness.session.clone();
        tokio::spawn(async move { session.send_plain("km.click(1)").await })
    };

    assert_eq!(device.recv_line().await.unwrap(), "km.click(1)");

    // The device echoes the command before answering;
    // the echo must not satisfy the request.
    device.send_line("km.click(1)").await;
    device.send_line("clicked").await;

    assert_eq!(task.await.unwrap().unwrap(), "clicked");
}

#[tokio::test]
async fn unanswered_command_times_out_and_late_response_is_harmless() {
    let (harness, mut device) = connected(test_config()).await;

    let task = {
        let session = harness.session.clone();
        tokio::spawn(async move {
            session
                .send_with_timeout("km.version()", Duration::from_millis(50))
                .await
        })
    };

    let line = device.recv_line().await.unwrap();
    let (_, tag) = line.rsplit_once('#').unwrap();

    assert!(matches!(task.await.unwrap(), Err(Error::Timeout(_))));

    // The response arrives after the requester gave up.
    device.send_line(&format!(">>> #{tag}:late")).await;

    // The session is unharmed: the next request works.
    let task = {
        let session = harness.session.clone();
        tokio::spawn(async move { session.send("km.version()").await })
    };
    answer_tracked(&mut device, "v3").await;
    assert_eq!(task.await.unwrap().unwrap(), "v3");
}

#[tokio::test]
async fn concurrent_requests_resolve_one_to_one() {
    let (harness, mut device) = connected(test_config()).await;

    const N: usize = 20;

    let mut tasks = Vec::new();
    for n in 0..N {
        let session = harness.session.clone();
        tasks.push(tokio::spawn(async move {
            session.send(&format!("km.probe({n})")).await
        }));
    }

    // Gather all commands first, then answer in reverse order to
    // prove matching is by tag, not by arrival order.
    let mut received = Vec::new();
    for _ in 0..N {
        let line = device.recv_line().await.unwrap();
        let (command, tag) = line.rsplit_once('#').unwrap();
        received.push((command.to_string(), tag.to_string()));
    }

    for (command, tag) in received.iter().rev() {
        device.send_line(&format!(">>> #{tag}:answer-{command}")).await;
    }

    for (n, task) in tasks.into_iter().enumerate() {
        assert_eq!(
            task.await.unwrap().unwrap(),
            format!("answer-km.probe({n})")
        );
    }
}

#[tokio::test]
async fn blocking_and_async_callers_share_the_session() {
    let (harness, mut device) = connected(test_config()).await;

    // A blocking caller on its own plain thread.
    let blocking = {
        let session = harness.session.clone();
        std::thread::spawn(move || session.send_sync("km.blocking()"))
    };

    let async_task = {
        let session = harness.session.clone();
        tokio::spawn(async move { session.send("km.async()").await })
    };

    // Both commands arrive; answer them whichever order they came in.
    for _ in 0..2 {
        let line = device.recv_line().await.unwrap();
        let (command, tag) = line.rsplit_once('#').unwrap();

        let payload = if command.contains("blocking") {
            "from-blocking"
        } else {
            "from-async"
        };
        device.send_line(&format!(">>> #{tag}:{payload}")).await;
    }

    assert_eq!(async_task.await.unwrap().unwrap(), "from-async");

    let blocking = tokio::task::spawn_blocking(move || blocking.join().unwrap())
        .await
        .unwrap();
    assert_eq!(blocking.unwrap(), "from-blocking");
}

#[tokio::test]
async fn fire_and_forget_reaches_the_wire() {
    let (harness, mut device) = connected(test_config()).await;

    harness.session.send_nowait("km.wheel(1)").unwrap();

    assert_eq!(device.recv_line().await.unwrap(), "km.wheel(1)");
}

#[tokio::test]
async fn sending_while_disconnected_fails_fast() {
    let harness = harness(test_config());

    assert!(matches!(
        harness.session.send("km.version()").await,
        Err(Error::NotConnected)
    ));
    assert!(matches!(
        harness.session.send_nowait("km.wheel(1)"),
        Err(Error::NotConnected)
    ));
}

//! Wire-level tests of the caller-side state machine against a scripted
//! daemon.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use common::{ScriptedPeer, wire};
use ssh_bridge::client::{BridgeClient, ChallengeHandler};
use ssh_bridge::error::ErrorKind;
use ssh_bridge::frame::{Frame, FrameType};
use ssh_bridge::request::{
    ChallengePayload, ChallengePrompt, ChallengeResponseParams, ConnectParams, ConnectedPayload,
    ReasonPayload, ResizeParams, ResultPayload, ReuseParams, SharedPayload,
};

fn connect_params() -> ConnectParams {
    ConnectParams {
        username: "deploy".to_string(),
        hostname: "build.example.com".to_string(),
        password: Some("hunter2".to_string()),
        ..Default::default()
    }
}

async fn connected_client() -> (BridgeClient, ScriptedPeer) {
    let (stream, mut daemon) = wire();
    let client = BridgeClient::new(stream);

    let outcome = {
        let connect = client.connect(connect_params(), None);
        tokio::pin!(connect);
        let received: ConnectParams = tokio::select! {
            params = daemon.expect_json(FrameType::Connect) => params,
            _ = &mut connect => panic!("connect resolved before the daemon answered"),
        };
        assert_eq!(received.username, "deploy");
        daemon
            .send_json(
                FrameType::Connected,
                &ConnectedPayload {
                    fingerprint: "fp".to_string(),
                    banner: Some("hi\n".to_string()),
                },
            )
            .await;
        connect.await.expect("connect outcome")
    };
    assert!(outcome.success);
    (client, daemon)
}

mod connect {
    use super::*;

    #[tokio::test]
    async fn test_successful_connect_surfaces_fingerprint_and_banner() {
        let (stream, mut daemon) = wire();
        let client = BridgeClient::new(stream);

        let connect = client.connect(connect_params(), None);
        tokio::pin!(connect);

        let sent: ConnectParams = tokio::select! {
            params = daemon.expect_json(FrameType::Connect) => params,
            _ = &mut connect => panic!("resolved early"),
        };
        assert_eq!(sent.hostname, "build.example.com");
        assert_eq!(sent.password.as_deref(), Some("hunter2"));

        daemon
            .send_json(
                FrameType::Connected,
                &ConnectedPayload {
                    fingerprint: "abc123".to_string(),
                    banner: None,
                },
            )
            .await;

        let outcome = connect.await.expect("outcome");
        assert!(outcome.success);
        assert_eq!(outcome.fingerprint.as_deref(), Some("abc123"));
        assert!(outcome.banner.is_none());
        assert!(!client.closed());
    }

    #[tokio::test]
    async fn test_unconnected_is_recoverable() {
        let (stream, mut daemon) = wire();
        let client = BridgeClient::new(stream);

        let connect = client.connect(connect_params(), None);
        tokio::pin!(connect);
        let _: ConnectParams = tokio::select! {
            params = daemon.expect_json(FrameType::Connect) => params,
            _ = &mut connect => panic!("resolved early"),
        };
        daemon
            .send_json(
                FrameType::Unconnected,
                &ReasonPayload {
                    reason: "authentication denied".to_string(),
                },
            )
            .await;

        let outcome = connect.await.expect("outcome");
        assert!(!outcome.success);
        assert_eq!(outcome.reason.as_deref(), Some("authentication denied"));
        assert!(!client.closed());

        // Back in the initial state: a second connect goes out on the wire.
        let retry = client.connect(connect_params(), None);
        tokio::pin!(retry);
        let _: ConnectParams = tokio::select! {
            params = daemon.expect_json(FrameType::Connect) => params,
            _ = &mut retry => panic!("resolved early"),
        };
        daemon
            .send_json(
                FrameType::Connected,
                &ConnectedPayload {
                    fingerprint: "fp".to_string(),
                    banner: None,
                },
            )
            .await;
        assert!(retry.await.expect("outcome").success);
    }

    #[tokio::test]
    async fn test_connect_in_ready_state_is_refused_without_killing_the_client() {
        let (client, _daemon) = connected_client().await;

        let err = client
            .connect(connect_params(), None)
            .await
            .expect_err("misuse");
        assert_eq!(err.kind, ErrorKind::ProtocolError);
        assert!(!client.closed());
    }

    #[tokio::test]
    async fn test_daemon_vanishing_mid_connect_is_no_daemon() {
        let (stream, mut daemon) = wire();
        let client = BridgeClient::new(stream);

        let connect = client.connect(connect_params(), None);
        tokio::pin!(connect);
        let _: ConnectParams = tokio::select! {
            params = daemon.expect_json(FrameType::Connect) => params,
            _ = &mut connect => panic!("resolved early"),
        };
        daemon.close().await;

        let err = connect.await.expect_err("terminal");
        assert_eq!(err.kind, ErrorKind::NoDaemon);
        assert!(client.closed());
    }
}

mod challenges {
    use super::*;

    struct Answering(Vec<String>);

    #[async_trait]
    impl ChallengeHandler for Answering {
        async fn handle(&self, _challenge: ChallengePayload) -> Result<Vec<String>, String> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl ChallengeHandler for Failing {
        async fn handle(&self, _challenge: ChallengePayload) -> Result<Vec<String>, String> {
            Err("user cancelled".to_string())
        }
    }

    /// Records the challenge it saw, then answers.
    struct Recording(Arc<Mutex<Option<ChallengePayload>>>);

    #[async_trait]
    impl ChallengeHandler for Recording {
        async fn handle(&self, challenge: ChallengePayload) -> Result<Vec<String>, String> {
            *self.0.lock() = Some(challenge);
            Ok(vec!["123456".to_string()])
        }
    }

    #[tokio::test]
    async fn test_challenge_round_trip() {
        let (stream, mut daemon) = wire();
        let client = BridgeClient::new(stream);
        let seen = Arc::new(Mutex::new(None));

        let connect = client.connect(connect_params(), Some(Arc::new(Recording(seen.clone()))));
        tokio::pin!(connect);
        let _: ConnectParams = tokio::select! {
            params = daemon.expect_json(FrameType::Connect) => params,
            _ = &mut connect => panic!("resolved early"),
        };

        daemon
            .send_json(
                FrameType::Challenge,
                &ChallengePayload {
                    title: "Two-factor".to_string(),
                    instructions: "Enter your code".to_string(),
                    language: String::new(),
                    prompts: vec![ChallengePrompt {
                        prompt: "Code:".to_string(),
                        echo: false,
                    }],
                },
            )
            .await;

        let answers: ChallengeResponseParams = tokio::select! {
            answers = daemon.expect_json(FrameType::ChallengeResponse) => answers,
            _ = &mut connect => panic!("resolved early"),
        };
        assert_eq!(answers.responses, vec!["123456".to_string()]);

        daemon
            .send_json(
                FrameType::Connected,
                &ConnectedPayload {
                    fingerprint: "fp".to_string(),
                    banner: None,
                },
            )
            .await;

        assert!(connect.await.expect("outcome").success);
        let challenge = seen.lock().take().expect("challenge recorded");
        assert_eq!(challenge.title, "Two-factor");
        assert_eq!(challenge.prompts.len(), 1);
        assert!(!challenge.prompts[0].echo);
    }

    #[tokio::test]
    async fn test_failing_handler_is_a_challenge_error() {
        let (stream, mut daemon) = wire();
        let client = BridgeClient::new(stream);

        let connect = client.connect(connect_params(), Some(Arc::new(Failing)));
        tokio::pin!(connect);
        let _: ConnectParams = tokio::select! {
            params = daemon.expect_json(FrameType::Connect) => params,
            _ = &mut connect => panic!("resolved early"),
        };
        daemon
            .send_json(
                FrameType::Challenge,
                &ChallengePayload {
                    title: String::new(),
                    instructions: String::new(),
                    language: String::new(),
                    prompts: vec![],
                },
            )
            .await;

        let err = connect.await.expect_err("terminal");
        assert_eq!(err.kind, ErrorKind::ChallengeError);
        assert!(client.closed());
    }

    #[tokio::test]
    async fn test_challenge_without_handler_is_a_challenge_error() {
        let (stream, mut daemon) = wire();
        let client = BridgeClient::new(stream);

        let connect = client.connect(connect_params(), None);
        tokio::pin!(connect);
        let _: ConnectParams = tokio::select! {
            params = daemon.expect_json(FrameType::Connect) => params,
            _ = &mut connect => panic!("resolved early"),
        };
        daemon
            .send_json(
                FrameType::Challenge,
                &ChallengePayload {
                    title: String::new(),
                    instructions: String::new(),
                    language: String::new(),
                    prompts: vec![],
                },
            )
            .await;

        let err = connect.await.expect_err("terminal");
        assert_eq!(err.kind, ErrorKind::ChallengeError);
    }

    #[tokio::test]
    async fn test_answers_for_a_previous_attempt_are_discarded() {
        let (stream, mut daemon) = wire();
        let client = BridgeClient::new(stream);

        // Slow handler: parks until the gate opens, long after the attempt
        // has failed and a new one started.
        struct Gated(Arc<tokio::sync::Notify>);

        #[async_trait]
        impl ChallengeHandler for Gated {
            async fn handle(&self, _challenge: ChallengePayload) -> Result<Vec<String>, String> {
                self.0.notified().await;
                Ok(vec!["stale".to_string()])
            }
        }

        let gate = Arc::new(tokio::sync::Notify::new());

        let connect = client.connect(connect_params(), Some(Arc::new(Gated(gate.clone()))));
        tokio::pin!(connect);
        let _: ConnectParams = tokio::select! {
            params = daemon.expect_json(FrameType::Connect) => params,
            _ = &mut connect => panic!("resolved early"),
        };
        daemon
            .send_json(
                FrameType::Challenge,
                &ChallengePayload {
                    title: String::new(),
                    instructions: String::new(),
                    language: String::new(),
                    prompts: vec![],
                },
            )
            .await;
        // First attempt fails while the handler is still parked.
        daemon
            .send_json(
                FrameType::Unconnected,
                &ReasonPayload {
                    reason: "authentication denied".to_string(),
                },
            )
            .await;
        assert!(!connect.await.expect("outcome").success);

        // Second attempt with an immediate handler.
        let retry = client.connect(connect_params(), Some(Arc::new(Answering(vec![
            "fresh".to_string(),
        ]))));
        tokio::pin!(retry);
        let _: ConnectParams = tokio::select! {
            params = daemon.expect_json(FrameType::Connect) => params,
            _ = &mut retry => panic!("resolved early"),
        };

        // Release the stale handler now; its answer must be dropped.
        gate.notify_one();
        daemon
            .send_json(
                FrameType::Challenge,
                &ChallengePayload {
                    title: String::new(),
                    instructions: String::new(),
                    language: String::new(),
                    prompts: vec![],
                },
            )
            .await;

        let answers: ChallengeResponseParams = tokio::select! {
            answers = daemon.expect_json(FrameType::ChallengeResponse) => answers,
            _ = &mut retry => panic!("resolved early"),
        };
        assert_eq!(answers.responses, vec!["fresh".to_string()]);

        daemon
            .send_json(
                FrameType::Connected,
                &ConnectedPayload {
                    fingerprint: "fp".to_string(),
                    banner: None,
                },
            )
            .await;
        assert!(retry.await.expect("outcome").success);
    }
}

mod exec {
    use super::*;

    #[tokio::test]
    async fn test_exec_streams_and_result() {
        let (client, mut daemon) = connected_client().await;

        let mut streams = {
            let exec = client.exec("ls -la", false);
            tokio::pin!(exec);
            let command = tokio::select! {
                frame = daemon.expect(FrameType::SimpleCommand) => frame,
                _ = &mut exec => panic!("resolved early"),
            };
            assert_eq!(command.payload.as_ref(), b"ls -la");
            exec.await.expect("streams")
        };

        daemon
            .send(Frame::new(FrameType::Stdout, b"total 0\n".as_slice()))
            .await;
        daemon
            .send(Frame::new(FrameType::Stderr, b"warning\n".as_slice()))
            .await;
        daemon
            .send_json(
                FrameType::Result,
                &ResultPayload {
                    code: Some(0),
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(
            streams.stdout.recv().await.expect("stdout").as_ref(),
            b"total 0\n"
        );
        assert_eq!(
            streams.stderr.recv().await.expect("stderr").as_ref(),
            b"warning\n"
        );
        let status = streams
            .result
            .await
            .expect("result delivered")
            .expect("clean exit");
        assert_eq!(status.code, Some(0));
        assert!(status.signal.is_none());

        // Streams end after the result.
        assert!(streams.stdout.recv().await.is_none());
        assert!(!client.closed());
    }

    #[tokio::test]
    async fn test_pty_exec_uses_the_pty_command_frame() {
        let (client, mut daemon) = connected_client().await;

        let exec = client.exec("top", true);
        tokio::pin!(exec);
        let frame = tokio::select! {
            frame = daemon.expect(FrameType::PtyCommand) => frame,
            _ = &mut exec => panic!("resolved early"),
        };
        assert_eq!(frame.payload.as_ref(), b"top");
        let _streams = exec.await.expect("streams");
    }

    #[tokio::test]
    async fn test_stdin_writes_and_eof() {
        let (client, mut daemon) = connected_client().await;

        let streams = {
            let exec = client.exec("cat", false);
            tokio::pin!(exec);
            let _ = tokio::select! {
                frame = daemon.expect(FrameType::SimpleCommand) => frame,
                _ = &mut exec => panic!("resolved early"),
            };
            exec.await.expect("streams")
        };

        streams.stdin.write(b"hello".as_slice());
        streams.stdin.finish();

        let data = daemon.expect(FrameType::Stdin).await;
        assert_eq!(data.payload.as_ref(), b"hello");
        let eof = daemon.expect(FrameType::Stdin).await;
        assert!(eof.payload.is_empty());
    }

    #[tokio::test]
    async fn test_exit_signal_result() {
        let (client, mut daemon) = connected_client().await;

        let streams = {
            let exec = client.exec("kill-self", false);
            tokio::pin!(exec);
            let _ = tokio::select! {
                frame = daemon.expect(FrameType::SimpleCommand) => frame,
                _ = &mut exec => panic!("resolved early"),
            };
            exec.await.expect("streams")
        };

        daemon
            .send_json(
                FrameType::Result,
                &ResultPayload {
                    signal: Some("SIGTERM".to_string()),
                    ..Default::default()
                },
            )
            .await;

        let status = streams.result.await.expect("delivered").expect("status");
        assert_eq!(status.signal.as_deref(), Some("SIGTERM"));
        assert!(status.code.is_none());
    }

    #[tokio::test]
    async fn test_result_error_is_terminal_ssh_error() {
        let (client, mut daemon) = connected_client().await;

        let streams = {
            let exec = client.exec("broken", false);
            tokio::pin!(exec);
            let _ = tokio::select! {
                frame = daemon.expect(FrameType::SimpleCommand) => frame,
                _ = &mut exec => panic!("resolved early"),
            };
            exec.await.expect("streams")
        };

        daemon
            .send_json(
                FrameType::Result,
                &ResultPayload {
                    error: Some("failed to open channel: eof".to_string()),
                    ..Default::default()
                },
            )
            .await;

        let err = streams
            .result
            .await
            .expect("delivered")
            .expect_err("terminal");
        assert_eq!(err.kind, ErrorKind::SshError);
        assert!(client.closed());
    }

    #[tokio::test]
    async fn test_exec_before_connect_is_refused() {
        let (stream, _daemon) = wire();
        let client = BridgeClient::new(stream);

        let err = client.exec("ls", false).await.expect_err("misuse");
        assert_eq!(err.kind, ErrorKind::ProtocolError);
        assert!(!client.closed());
    }
}

mod sharing {
    use super::*;

    #[tokio::test]
    async fn test_share_returns_key_and_resets_to_initial() {
        let (client, mut daemon) = connected_client().await;

        let share_key = {
            let share = client.share();
            tokio::pin!(share);
            let frame = tokio::select! {
                frame = daemon.expect(FrameType::Share) => frame,
                _ = &mut share => panic!("resolved early"),
            };
            assert!(frame.payload.is_empty());
            daemon
                .send_json(
                    FrameType::Shared,
                    &SharedPayload {
                        share_key: "deadbeefdeadbeefdeadbeefdeadbeef".to_string(),
                    },
                )
                .await;
            share.await.expect("share key")
        };
        assert_eq!(share_key, "deadbeefdeadbeefdeadbeefdeadbeef");

        // Back to Initial: reuse with the share key is legal now.
        let reuse = client.reuse(ReuseParams {
            username: "deploy".to_string(),
            hostname: "build.example.com".to_string(),
            share_key: Some(share_key),
            ..Default::default()
        });
        tokio::pin!(reuse);
        let sent: ReuseParams = tokio::select! {
            params = daemon.expect_json(FrameType::Reuse) => params,
            _ = &mut reuse => panic!("resolved early"),
        };
        assert!(sent.share_key.is_some());
        daemon
            .send_json(
                FrameType::Connected,
                &ConnectedPayload {
                    fingerprint: "fp".to_string(),
                    banner: None,
                },
            )
            .await;
        assert!(reuse.await.expect("outcome").success);
    }
}

mod resize {
    use super::*;

    #[tokio::test]
    async fn test_resize_is_valid_before_connecting() {
        let (stream, mut daemon) = wire();
        let client = BridgeClient::new(stream);

        client.resize(50, 132).await.expect("resize");
        let sent: ResizeParams = daemon.expect_json(FrameType::Resize).await;
        assert_eq!(sent.rows, 50);
        assert_eq!(sent.cols, 132);
    }

    #[tokio::test]
    async fn test_resize_while_ready() {
        let (client, mut daemon) = connected_client().await;

        client.resize(1000, -1).await.expect("resize");
        let sent: ResizeParams = daemon.expect_json(FrameType::Resize).await;
        assert_eq!(sent.rows, 1000);
        assert_eq!(sent.cols, -1);
    }
}

mod terminal_errors {
    use super::*;

    #[tokio::test]
    async fn test_exception_while_idle_is_stashed_and_raised_once() {
        let (client, mut daemon) = connected_client().await;

        daemon
            .send_json(
                FrameType::Exception,
                &ReasonPayload {
                    reason: "unexpected SHARE frame in initial state".to_string(),
                },
            )
            .await;

        // Give the driver a moment to process the frame.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(client.closed());

        let first = client.exec("ls", false).await.expect_err("stashed");
        assert_eq!(first.kind, ErrorKind::DaemonError);
        assert!(first.cause.is_none());

        let second = client.exec("ls", false).await.expect_err("generic");
        assert_eq!(second.kind, ErrorKind::Closed);
        let cause = second.cause.as_deref().expect("cause");
        assert_eq!(cause.kind, ErrorKind::DaemonError);
    }

    #[tokio::test]
    async fn test_disconnected_reason_is_carried() {
        let (client, mut daemon) = connected_client().await;

        daemon
            .send_json(
                FrameType::Disconnected,
                &ReasonPayload {
                    reason: "remote connection closed unexpectedly".to_string(),
                },
            )
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(client.closed());

        let err = client.exec("ls", false).await.expect_err("stashed");
        assert_eq!(err.kind, ErrorKind::NoSsh);
        assert_eq!(err.message, "remote connection closed unexpectedly");
    }

    #[tokio::test]
    async fn test_unexpected_frame_is_a_protocol_error() {
        let (client, mut daemon) = connected_client().await;

        // A RESULT with no execution in flight.
        daemon
            .send_json(
                FrameType::Result,
                &ResultPayload {
                    code: Some(0),
                    ..Default::default()
                },
            )
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(client.closed());
        let err = client.share().await.expect_err("stashed");
        assert_eq!(err.kind, ErrorKind::ProtocolError);
    }
}

mod closing {
    use super::*;

    #[tokio::test]
    async fn test_close_cancels_pending_connect() {
        let (stream, mut daemon) = wire();
        let client = Arc::new(BridgeClient::new(stream));

        let connect_client_handle = client.clone();
        let connect =
            tokio::spawn(async move { connect_client_handle.connect(connect_params(), None).await });

        let _: ConnectParams = daemon.expect_json(FrameType::Connect).await;
        client.close().await;

        let err = connect
            .await
            .expect("join")
            .expect_err("cancelled by close");
        assert_eq!(err.kind, ErrorKind::Closed);
        assert!(client.closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_never_fails() {
        let (stream, _daemon) = wire();
        let client = BridgeClient::new(stream);

        client.close().await;
        client.close().await;
        assert!(client.closed());
    }

    #[tokio::test]
    async fn test_operations_after_close_get_the_closed_error() {
        let (stream, _daemon) = wire();
        let client = BridgeClient::new(stream);
        client.close().await;

        let err = client
            .connect(connect_params(), None)
            .await
            .expect_err("closed");
        assert_eq!(err.kind, ErrorKind::Closed);
    }
}

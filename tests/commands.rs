//! Command Integration Tests
//!
//! Resolver, machine info, filesystem and auth commands over a live agent.

mod integration_harness;

use bytes::Bytes;
use integration_harness::{TestAgent, token};
use std::time::Duration;
use wsrelay_protocol::{
    AuthErrorReply, CommandType, FileData, FileEntry, FileOpenRequest, FileReadRequest,
    InfoReply, KerberosRequest, NameList, PathPair, PathRequest, Payload,
};

/// Test: RESOLV keeps input order and blanks failures
#[tokio::test]
async fn test_resolv_order() {
    let agent = TestAgent::start().await;
    let mut controller = agent.controller().await;
    let t = token(1);

    let names = NameList(vec![
        "127.0.0.1".into(),
        "nonexistent.invalid".into(),
        "::1".into(),
    ]);
    controller.send(CommandType::Resolv, t, names.encode()).await;
    let frame = controller.expect(CommandType::Resolv, t).await;
    let NameList(results) = NameList::decode(&frame.payload).unwrap();
    assert_eq!(results, vec!["127.0.0.1", "", "::1"]);

    agent.stop().await;
}

/// Test: GETINFO answers with this process
#[tokio::test]
async fn test_getinfo() {
    let agent = TestAgent::start().await;
    let mut controller = agent.controller().await;
    let t = token(2);

    controller.send(CommandType::GetInfo, t, Bytes::new()).await;
    let frame = controller.expect(CommandType::GetInfoReply, t).await;
    let info = InfoReply::decode(&frame.payload).unwrap();
    assert_eq!(info.pid, std::process::id().to_string());
    assert!(!info.cpu_arch.is_empty());

    agent.stop().await;
}

/// Test: directory and file commands
#[tokio::test]
async fn test_file_commands() {
    let tmp = tempfile::TempDir::new().unwrap();
    let root = tmp.path().display().to_string();
    let agent = TestAgent::start().await;
    let mut controller = agent.controller().await;
    let t = token(3);

    let dir = format!("{}/src", root);
    controller
        .send(CommandType::DirMk, t, PathRequest { path: dir.clone() }.encode())
        .await;
    controller.expect(CommandType::Ok, t).await;

    let file = format!("{}/note.txt", dir);
    let open = FileOpenRequest {
        path: file.clone(),
        mode: "w".into(),
    };
    controller.send(CommandType::FileOpen, t, open.encode()).await;
    controller.expect(CommandType::Continue, t).await;

    let write = FileData {
        offset: 0,
        data: Bytes::from_static(b"relayed"),
    };
    controller.send(CommandType::FileData, t, write.encode()).await;
    controller.expect(CommandType::Continue, t).await;
    controller.send(CommandType::Ok, t, Bytes::new()).await;

    let copy = PathPair {
        src: dir.clone(),
        dst: format!("{}/copy", root),
    };
    controller.send(CommandType::DirCopy, t, copy.encode()).await;
    controller.expect(CommandType::Ok, t).await;

    controller
        .send(CommandType::DirLs, t, PathRequest { path: format!("{}/copy", root) }.encode())
        .await;
    let entry = FileEntry::decode(&controller.expect(CommandType::FileEntry, t).await.payload).unwrap();
    assert_eq!(entry.name, "note.txt");
    assert_eq!(entry.size, 7);
    controller.expect(CommandType::Ok, t).await;

    // Read it back through a second token
    let r = token(4);
    let open = FileOpenRequest {
        path: format!("{}/copy/note.txt", root),
        mode: "rb".into(),
    };
    controller.send(CommandType::FileOpen, r, open.encode()).await;
    controller.expect(CommandType::Continue, r).await;
    controller
        .send(CommandType::FileRead, r, FileReadRequest { offset: 2, size: 64 }.encode())
        .await;
    let data = FileData::decode(&controller.expect(CommandType::FileData, r).await.payload).unwrap();
    assert_eq!(&data.data[..], b"layed");

    let moved = PathPair {
        src: dir,
        dst: format!("{}/copy", root),
    };
    controller.send(CommandType::DirMove, t, moved.encode()).await;
    assert!(controller.expect_err(t).await.starts_with("Error! Destination already exists"));

    controller
        .send(CommandType::FileRead, t, FileReadRequest { offset: 0, size: 1 }.encode())
        .await;
    assert_eq!(controller.expect_err(t).await, "File not opened for token!");

    agent.stop().await;
}

/// Test: auth commands without a platform provider
#[tokio::test]
async fn test_auth_without_provider() {
    let agent = TestAgent::start().await;
    let mut controller = agent.controller().await;
    let t = token(5);

    controller.send(CommandType::Sequence, t, Bytes::new()).await;
    let reply = AuthErrorReply::decode(&controller.expect(CommandType::AuthErr, t).await.payload).unwrap();
    assert_eq!(reply.status, -1);
    assert_eq!(reply.message, "No session found for token");

    let kerberos = KerberosRequest {
        username: None,
        credential_usage: 2,
        context_attributes: 0,
        target: Some("HTTP/example".into()),
        auth_data: None,
    };
    controller.send(CommandType::Kerberos, t, kerberos.encode()).await;
    let reply = AuthErrorReply::decode(&controller.expect(CommandType::AuthErr, t).await.payload).unwrap();
    assert_eq!(reply.status, 0x8009_0302_u32 as i32 as i64);

    agent.stop().await;
}

/// Test: frames the agent does not handle get no reply
#[tokio::test]
async fn test_unhandled_commands_are_dropped() {
    let agent = TestAgent::start().await;
    let mut controller = agent.controller().await;

    controller.send(CommandType::Nop, token(6), Bytes::new()).await;
    controller.send(CommandType::Log, token(6), Bytes::from_static(b"hello")).await;
    controller.expect_silence(Duration::from_millis(200)).await;

    // Connection still usable
    controller.send(CommandType::Sd, token(6), Bytes::new()).await;
    assert_eq!(
        controller.expect_err(token(6)).await,
        "No socket session found for token"
    );

    agent.stop().await;
}

//! End-to-end tests: whole services exchanging messages over loopback
//! UDP, including relaying through a gateway process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use mlink::ipc::{
    ChannelService, CompletionStatus, Configuration, JsonProtocol, Message, downcast, flags,
};

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
struct Echo {
    text: String,
}

impl Message for Echo {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

const ECHO_TYPE: u32 = 1;

fn protocol() -> Arc<JsonProtocol> {
    let mut p = JsonProtocol::new();
    p.register::<Echo>(ECHO_TYPE);
    Arc::new(p)
}

fn free_addr() -> SocketAddr {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind probe");
    socket.local_addr().expect("probe addr")
}

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread")]
async fn echo_between_two_services() {
    let a_addr = free_addr();
    let b_addr = free_addr();

    let mut a = ChannelService::start(Configuration::new(a_addr), protocol())
        .await
        .unwrap();
    let mut b = ChannelService::start(Configuration::new(b_addr), protocol())
        .await
        .unwrap();

    let msg = Arc::new(Echo {
        text: "over and out".into(),
    });
    a.service
        .send_message(b_addr, msg, ECHO_TYPE, 0)
        .await
        .unwrap();

    // B receives and echoes on the same session
    let incoming = timeout(WAIT, b.incoming.recv())
        .await
        .expect("delivery within deadline")
        .expect("stream open");
    let received = downcast::<Echo>(&incoming.msg).unwrap();
    assert_eq!(received.text, "over and out");
    b.service
        .send_message_to(incoming.ctx.connection, incoming.msg, ECHO_TYPE, 0)
        .unwrap();

    let echoed = timeout(WAIT, a.incoming.recv())
        .await
        .expect("echo within deadline")
        .expect("stream open");
    assert_eq!(downcast::<Echo>(&echoed.msg).unwrap().text, "over and out");

    // the original send completed successfully on A
    let completed = timeout(WAIT, a.completed.recv())
        .await
        .expect("completion within deadline")
        .expect("stream open");
    assert_eq!(completed.status, CompletionStatus::Success);

    a.service.stop();
    b.service.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn request_response_across_services() {
    let a_addr = free_addr();
    let b_addr = free_addr();

    let mut a = ChannelService::start(Configuration::new(a_addr), protocol())
        .await
        .unwrap();
    let mut b = ChannelService::start(Configuration::new(b_addr), protocol())
        .await
        .unwrap();

    let request = Arc::new(Echo {
        text: "question".into(),
    });
    a.service
        .send_message(b_addr, request, ECHO_TYPE, flags::WAIT_RESPONSE)
        .await
        .unwrap();

    let incoming = timeout(WAIT, b.incoming.recv())
        .await
        .expect("request within deadline")
        .expect("stream open");
    assert!(incoming.ctx.request_uid.is_valid());
    let reply = Arc::new(Echo {
        text: "answer".into(),
    });
    b.service
        .respond(
            incoming.ctx.connection,
            incoming.ctx.request_uid,
            reply,
            ECHO_TYPE,
            0,
        )
        .unwrap();

    let completed = timeout(WAIT, a.completed.recv())
        .await
        .expect("completion within deadline")
        .expect("stream open");
    assert_eq!(completed.status, CompletionStatus::Success);
    assert_eq!(
        downcast::<Echo>(&completed.msg).unwrap().text,
        "question"
    );
    let response = completed.response.expect("response attached");
    assert_eq!(downcast::<Echo>(&response).unwrap().text, "answer");

    a.service.stop();
    b.service.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn relayed_session_through_gateway() {
    let a_addr = free_addr();
    let b_addr = free_addr();
    let gw_addr = free_addr();

    let mut a_config = Configuration::new(a_addr);
    a_config.local_network_id = 1;
    a_config.gateway_addresses = vec![gw_addr];

    let mut b_config = Configuration::new(b_addr);
    b_config.local_network_id = 2;
    b_config.gateway_addresses = vec![gw_addr];

    let mut gw_config = Configuration::new(gw_addr);
    gw_config.local_network_id = 0;
    // a non-empty relay vector marks the process as a gateway
    gw_config.relay_gateways = vec![gw_addr];

    let mut a = ChannelService::start(a_config, protocol()).await.unwrap();
    let mut b = ChannelService::start(b_config, protocol()).await.unwrap();
    let _gw = ChannelService::start(gw_config, protocol()).await.unwrap();

    let msg = Arc::new(Echo {
        text: "across networks".into(),
    });
    a.service
        .send_message_relayed(b_addr, 2, msg, ECHO_TYPE, 0)
        .await
        .unwrap();

    let incoming = timeout(WAIT, b.incoming.recv())
        .await
        .expect("relayed delivery within deadline")
        .expect("stream open");
    assert_eq!(
        downcast::<Echo>(&incoming.msg).unwrap().text,
        "across networks"
    );

    // the reverse path flows through the gateway too
    let reply = Arc::new(Echo {
        text: "and back".into(),
    });
    b.service
        .send_message_to(incoming.ctx.connection, reply, ECHO_TYPE, 0)
        .unwrap();
    let back = timeout(WAIT, a.incoming.recv())
        .await
        .expect("reverse delivery within deadline")
        .expect("stream open");
    assert_eq!(downcast::<Echo>(&back.msg).unwrap().text, "and back");

    let completed = timeout(WAIT, a.completed.recv())
        .await
        .expect("completion within deadline")
        .expect("stream open");
    assert_eq!(completed.status, CompletionStatus::Success);

    a.service.stop();
    b.service.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_completes_outstanding_messages() {
    let a_addr = free_addr();
    let black_hole = free_addr(); // nothing listens here

    let mut a = ChannelService::start(Configuration::new(a_addr), protocol())
        .await
        .unwrap();

    a.service
        .send_message(
            black_hole,
            Arc::new(Echo {
                text: "nowhere".into(),
            }),
            ECHO_TYPE,
            0,
        )
        .await
        .unwrap();

    a.service.stop();
    let completed = timeout(WAIT, a.completed.recv())
        .await
        .expect("teardown completion within deadline")
        .expect("stream open");
    assert_eq!(completed.status, CompletionStatus::NotSent);

    // sending after stop is a caller error with no side effects
    let err = a
        .service
        .send_message(
            black_hole,
            Arc::new(Echo { text: "late".into() }),
            ECHO_TYPE,
            0,
        )
        .await
        .unwrap_err();
    assert!(err.is_caller_error());
}

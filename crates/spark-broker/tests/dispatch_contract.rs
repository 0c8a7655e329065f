//! 分发状态机契约测试
//!
//! # 教案级导览
//!
//! - **核心目标 (Why)**：以传输层视角驱动 [`Broker::receive_request`]，验证方法 × 路径分支表、
//!   主题自动建档的层级限制，以及删除时的观察者推送；
//! - **结构 (How)**：每个测试通过 `outbound_channel()` 拿到出站队列的消费端，
//!   用 `try_recv` 精确统计推送条数；观察关系的强引用保存在测试持有的事务里；
//! - **契约 (What)**：响应码、推送序号与报文类型均按协议数值断言，不依赖日志输出。

use std::{net::SocketAddr, sync::Arc};

use spark_broker::{
    Broker, BrokerConfig,
    core::{
        message::{ContentFormat, MessageType, Method, Request, ResponseCode, Token, Transaction},
        outbound::{OutboundReceiver, outbound_channel},
    },
};

fn broker() -> (Broker, OutboundReceiver) {
    let (queue, rx) = outbound_channel();
    let broker = Broker::new(BrokerConfig::default(), Arc::new(queue)).expect("default config");
    (broker, rx)
}

fn peer(port: u16) -> SocketAddr {
    SocketAddr::from(([198, 51, 100, 7], port))
}

fn send(broker: &Broker, request: Request) -> Transaction {
    broker.receive_request(Transaction::new(request))
}

fn code(tx: &Transaction) -> Option<ResponseCode> {
    tx.response().and_then(|response| response.code)
}

/// 响应骨架必须回带令牌并回送到源地址，失败分支也不例外。
#[test]
fn response_mirrors_token_and_source() {
    let (broker, _rx) = broker();
    let tx = send(
        &broker,
        Request::new(Method::Get, "missing", peer(4000)).token(Token::new(&b"\xca\xfe"[..])),
    );
    let response = tx.response().expect("response");
    assert_eq!(response.code, Some(ResponseCode::NotFound));
    assert_eq!(response.destination, peer(4000));
    assert_eq!(response.token.as_bytes(), b"\xca\xfe");
}

/// ## 性质：既有资源上的重复 PUT 幂等
///
/// - **意图 (Why)**：发布者会反复向同一主题推送，路径与子节点集合必须保持稳定；
/// - **契约 (What)**：首次 PUT 自动建档得到 2.01，之后每次均为 2.04，子节点列表不变。
#[test]
fn repeated_put_is_idempotent() {
    let (broker, _rx) = broker();
    let first = send(&broker, Request::new(Method::Put, "ps/temp", peer(1)).payload(&b"20"[..]));
    assert_eq!(code(&first), Some(ResponseCode::Created));

    let before = broker.namespace().children("/ps").expect("children").len();
    for _ in 0..3 {
        let again = send(&broker, Request::new(Method::Put, "ps/temp", peer(1)).payload(&b"20"[..]));
        assert_eq!(code(&again), Some(ResponseCode::Changed));
    }
    let children = broker.namespace().children("/ps").expect("children");
    assert_eq!(children.len(), before);
    assert_eq!(children[0].path(), "/ps/temp");
    assert!(broker.namespace().children("/ps/temp").expect("leaf").is_empty());
}

/// ## 性质：自动建档恰好一级
#[test]
fn auto_create_is_limited_to_one_level() {
    let (broker, _rx) = broker();
    assert_eq!(
        code(&send(&broker, Request::new(Method::Put, "ps/parent", peer(1)))),
        Some(ResponseCode::Created)
    );
    let nested = send(
        &broker,
        Request::new(Method::Put, "ps/parent/missingChild", peer(1)).content_format(ContentFormat::JSON),
    );
    assert_eq!(code(&nested), Some(ResponseCode::Created));
    let child = broker.namespace().resolve("/ps/parent/missingChild").expect("child");
    assert_eq!(child.name(), "missingChild");
    assert_eq!(child.content_format(), ContentFormat::JSON);

    let size = broker.namespace().len();
    let orphan = send(&broker, Request::new(Method::Put, "ps/missingParent/missingChild", peer(1)));
    assert_eq!(code(&orphan), Some(ResponseCode::NotFound));
    assert_eq!(broker.namespace().len(), size, "失败的自动建档不得留下任何节点");
    assert!(broker.namespace().resolve("/ps/missingParent").is_err());
}

/// 保留前缀之外的 PUT 不会建档，POST 与 DELETE 也不会触发自动建档。
#[test]
fn auto_create_is_put_only_and_prefix_bound() {
    let (broker, _rx) = broker();
    assert_eq!(
        code(&send(&broker, Request::new(Method::Put, "elsewhere", peer(1)))),
        Some(ResponseCode::NotFound)
    );
    assert_eq!(
        code(&send(&broker, Request::new(Method::Put, "psx/t", peer(1)))),
        Some(ResponseCode::NotFound)
    );
    assert_eq!(
        code(&send(&broker, Request::new(Method::Post, "ps/nothing", peer(1)))),
        Some(ResponseCode::NotFound)
    );
    assert_eq!(
        code(&send(&broker, Request::new(Method::Delete, "ps/nothing", peer(1)))),
        Some(ResponseCode::NotFound)
    );
    assert!(broker.namespace().resolve("/ps/nothing").is_err());
}

/// ## 性质：删除恰好通知每个当前观察者一次
///
/// - **契约 (What)**：N 个观察者 ⇒ N 条推送；每条为 4.04、`Non`、序号为删除前计数 + 1；
///   删除后资源不可解析，登记表中不再有该路径的条目。
#[test]
fn delete_notifies_each_observer_once() {
    let (broker, mut rx) = broker();
    send(&broker, Request::new(Method::Put, "ps/r", peer(1)).payload(&b"a"[..]));
    send(&broker, Request::new(Method::Put, "ps/r", peer(1)).payload(&b"b"[..]));
    let count = broker.namespace().resolve("/ps/r").expect("r").observe_count();
    assert_eq!(count, 2);

    let observers: Vec<Transaction> = (0..3u16)
        .map(|i| {
            let token = Token::new(vec![i as u8]);
            let tx = send(
                &broker,
                Request::new(Method::Get, "ps/r", peer(5000 + i)).token(token).observe(0),
            );
            assert_eq!(tx.response().and_then(|r| r.observe), Some(count));
            tx
        })
        .collect();
    assert_eq!(broker.observers().observer_count("/ps/r"), 3);

    let deleted = send(&broker, Request::new(Method::Delete, "ps/r", peer(9)));
    assert_eq!(code(&deleted), Some(ResponseCode::Deleted));

    let mut destinations = Vec::new();
    while let Ok(push) = rx.try_recv() {
        assert_eq!(push.code, Some(ResponseCode::NotFound));
        assert_eq!(push.observe, Some(count + 1));
        assert_eq!(push.mtype, Some(MessageType::Non));
        assert_eq!(push.token.as_bytes(), &[(push.destination.port() - 5000) as u8]);
        destinations.push(push.destination);
    }
    destinations.sort();
    assert_eq!(destinations, [peer(5000), peer(5001), peer(5002)]);
    assert!(broker.namespace().resolve("/ps/r").is_err());
    assert_eq!(broker.observers().observer_count("/ps/r"), 0);
    drop(observers);
}

/// 子树删除时，后代资源的观察者同样收到 4.04。
#[test]
fn subtree_delete_reaches_descendant_observers() {
    let (broker, mut rx) = broker();
    send(&broker, Request::new(Method::Put, "ps/a", peer(1)));
    send(&broker, Request::new(Method::Put, "ps/a/b", peer(1)));
    let watcher = send(&broker, Request::new(Method::Get, "ps/a/b", peer(77)).observe(0));

    send(&broker, Request::new(Method::Delete, "ps/a", peer(1)));
    let push = rx.try_recv().expect("descendant notification");
    assert_eq!(push.destination, peer(77));
    assert_eq!(push.code, Some(ResponseCode::NotFound));
    assert!(rx.try_recv().is_err());
    assert!(broker.namespace().resolve("/ps/a/b").is_err());
    drop(watcher);
}

/// 连接丢失后不再推送；丢弃观察句柄与显式注销效果一致。
#[test]
fn lost_connections_stop_receiving_updates() {
    let (broker, mut rx) = broker();
    send(&broker, Request::new(Method::Put, "ps/t", peer(1)));
    let kept = send(&broker, Request::new(Method::Get, "ps/t", peer(10)).observe(0));
    let dropped = send(&broker, Request::new(Method::Get, "ps/t", peer(11)).observe(0));
    let lost = send(&broker, Request::new(Method::Get, "ps/t", peer(12)).observe(0));

    drop(dropped);
    assert_eq!(broker.connection_lost(lost.id()), 1);

    send(&broker, Request::new(Method::Put, "ps/t", peer(1)).payload(&b"x"[..]));
    let push = rx.try_recv().expect("one update");
    assert_eq!(push.destination, peer(10));
    assert_eq!(push.code, Some(ResponseCode::Content));
    assert!(rx.try_recv().is_err());
    drop(kept);
}

/// Observe=1 注销同一端点同一令牌的订阅。
#[test]
fn observe_deregistration_by_token() {
    let (broker, mut rx) = broker();
    send(&broker, Request::new(Method::Put, "ps/t", peer(1)));
    let token = Token::new(&b"k"[..]);
    let subscription = send(
        &broker,
        Request::new(Method::Get, "ps/t", peer(10)).token(token.clone()).observe(0),
    );
    send(&broker, Request::new(Method::Get, "ps/t", peer(10)).token(token).observe(1));
    send(&broker, Request::new(Method::Put, "ps/t", peer(1)));
    assert!(rx.try_recv().is_err());
    assert!(subscription.observation().expect("observation").is_cancelled());
}

/// ## 性质：根路径与发现路径都不作为内容资源解析
#[test]
fn root_is_not_found_and_discovery_lists_top_level() {
    let (broker, _rx) = broker();
    for raw in ["", "/", "//"] {
        assert_eq!(
            code(&send(&broker, Request::new(Method::Get, raw, peer(1)))),
            Some(ResponseCode::NotFound),
            "`{raw}` 不应被解析为资源"
        );
    }

    let listing = send(&broker, Request::new(Method::Get, ".well-known/core", peer(1)));
    let response = listing.response().expect("response");
    assert_eq!(response.code, Some(ResponseCode::Content));
    assert_eq!(response.content_format, Some(ContentFormat::LINK_FORMAT));
    let body = std::str::from_utf8(&response.payload).expect("utf8");
    assert!(body.starts_with(r#"</ps>;ct=0;rt="core.ps";obs"#), "{body}");
    assert!(body.contains("</rd>"));
    assert!(body.contains("</rd-lookup>"));
    assert!(!body.contains("</rd-lookup/res>"), "只列出顶层资源");

    let filtered = send(
        &broker,
        Request::new(Method::Get, ".well-known/core", peer(1)).query("rt=core.ps"),
    );
    assert_eq!(
        &filtered.response().expect("response").payload[..],
        br#"</ps>;ct=0;rt="core.ps";obs"#
    );
}

/// POST 以链接格式载荷建议子主题名，重复创建返回 4.09。
#[test]
fn post_creates_topics_from_link_payload() {
    let (broker, _rx) = broker();
    let created = send(
        &broker,
        Request::new(Method::Post, "ps", peer(1)).payload(&b"<news>;ct=0;"[..]),
    );
    let response = created.response().expect("response");
    assert_eq!(response.code, Some(ResponseCode::Created));
    assert_eq!(response.location_path.as_deref(), Some("ps/news"));

    let duplicate = send(
        &broker,
        Request::new(Method::Post, "ps", peer(1)).payload(&b"<news>;ct=0;"[..]),
    );
    assert_eq!(code(&duplicate), Some(ResponseCode::Conflict));

    let malformed = send(&broker, Request::new(Method::Post, "ps", peer(1)).payload(&b"news"[..]));
    assert_eq!(code(&malformed), Some(ResponseCode::BadRequest));
}

/// 未识别的方法码不产生任何响应。
#[test]
fn unknown_methods_are_dropped_silently() {
    let (broker, mut rx) = broker();
    let tx = send(&broker, Request::with_code(7, "ps", peer(1)));
    assert!(tx.response().is_none());
    assert!(rx.try_recv().is_err());
}

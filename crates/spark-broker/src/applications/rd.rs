//! # 资源目录入口资源
//!
//! ## 设计定位（Why）
//! - 把 [`DirectoryService`] 暴露为命名空间中的普通资源，远端终端与客户端通过同一套
//!   GET/POST/DELETE 分发规则完成注册与查询；
//! - 五个入口：`rd`（注册）、`rd/<ep>`（单个注册）、`rd-lookup`（终端查询）、
//!   `rd-lookup/res`（资源查询）、`rd-lookup/ep`（按终端名查询）。
//!
//! ## 报文约定（What）
//! - 注册：`POST /rd?ep=<名>&lt=<秒>&base=<URI>`，载荷为链接格式；缺省 `base` 取请求源地址；
//! - 查询结果均为链接格式（ct=40），无结果时返回空载荷的 2.05。

use std::{borrow::ToOwned, string::String, sync::Arc, time::Duration, vec::Vec};

use bytes::Bytes;

use crate::{
    applications::directory::{DirectoryEntry, DirectoryService, Registration},
    core::{
        link_format::{self, Link},
        message::{ContentFormat, Method, Request},
        namespace::{Representation, ResourceDescriptor, ResourceNamespace, ResourceNode},
        path::ROOT,
        resource_layer::{PostOutcome, ResourceHandler, method_not_allowed},
    },
    error::BrokerError,
};

pub const REGISTRATION: &str = "rd";
pub const LOOKUP: &str = "rd-lookup";
pub const LOOKUP_RESOURCES: &str = "res";
pub const LOOKUP_ENDPOINTS: &str = "ep";

/// 在命名空间中挂载目录入口资源。
pub fn install(namespace: &ResourceNamespace, directory: &Arc<DirectoryService>) -> Result<(), BrokerError> {
    let registration = RegistrationResource {
        directory: Arc::clone(directory),
    };
    namespace.insert(
        ROOT,
        REGISTRATION,
        ResourceDescriptor::handled(Arc::new(registration)).with_resource_type("core.rd"),
    )?;

    let lookup_path = format!("/{LOOKUP}");
    for (parent, name, kind, rt) in [
        (ROOT, LOOKUP, LookupKind::Endpoints, "core.rd-lookup"),
        (lookup_path.as_str(), LOOKUP_RESOURCES, LookupKind::Resources, "core.rd-lookup-res"),
        (lookup_path.as_str(), LOOKUP_ENDPOINTS, LookupKind::Endpoint, "core.rd-lookup-ep"),
    ] {
        let resource = LookupResource {
            directory: Arc::clone(directory),
            kind,
        };
        namespace.insert(
            parent,
            name,
            ResourceDescriptor::handled(Arc::new(resource))
                .with_resource_type(rt)
                .with_content_format(ContentFormat::LINK_FORMAT),
        )?;
    }
    tracing::debug!("resource directory mounted");
    Ok(())
}

/// `rd`：接受注册。
#[derive(Debug)]
pub struct RegistrationResource {
    directory: Arc<DirectoryService>,
}

impl ResourceHandler for RegistrationResource {
    fn render_get(&self, node: &ResourceNode, _request: &Request) -> Result<Representation, BrokerError> {
        Err(method_not_allowed(node, Method::Get))
    }

    fn render_post(&self, _node: &ResourceNode, request: &Request) -> Result<PostOutcome, BrokerError> {
        let endpoint = request
            .query_value("ep")
            .filter(|ep| !ep.is_empty())
            .ok_or_else(|| BrokerError::validation("registration requires an `ep` query parameter"))?;
        let locator = match request.query_value("base") {
            Some(base) if !base.is_empty() => base.to_owned(),
            _ => format!("coap://{}", request.source),
        };

        let mut registration = Registration::new(endpoint, locator).links(parse_payload(&request.payload)?);
        if let Some(lt) = request.query_value("lt") {
            let secs = lt
                .parse::<u64>()
                .map_err(|_| BrokerError::validation(format!("invalid lifetime `{lt}`")))?;
            registration = registration.lifetime(Duration::from_secs(secs));
        }
        let handle = self.directory.register(registration)?;

        let resource = RegisteredEndpoint {
            directory: Arc::clone(&self.directory),
            endpoint: handle.endpoint().to_owned(),
        };
        Ok(PostOutcome::Child {
            name: handle.endpoint().to_owned(),
            descriptor: ResourceDescriptor::handled(Arc::new(resource))
                .with_content_format(ContentFormat::LINK_FORMAT)
                .observable(true),
            refreshed: handle.refreshed(),
        })
    }

    fn render_put(&self, node: &ResourceNode, _request: &Request) -> Result<(), BrokerError> {
        Err(method_not_allowed(node, Method::Put))
    }

    fn render_delete(&self, node: &ResourceNode, _request: &Request) -> Result<(), BrokerError> {
        Err(method_not_allowed(node, Method::Delete))
    }
}

/// `rd/<ep>`：单个终端的注册资源。
///
/// - GET 返回注册时的链接，可被观察；POST 续期；
/// - DELETE 先注销目录条目，再由常规删除路径摘除节点并通知观察者；
/// - 过期清扫不经过本处理器，由 [`Broker::evict_expired`](crate::broker::Broker::evict_expired)
///   在确认条目仍缺席后摘除节点。
#[derive(Debug)]
pub struct RegisteredEndpoint {
    directory: Arc<DirectoryService>,
    endpoint: String,
}

impl ResourceHandler for RegisteredEndpoint {
    fn render_get(&self, node: &ResourceNode, _request: &Request) -> Result<Representation, BrokerError> {
        let entry = self.directory.lookup_by_endpoint(&self.endpoint)?;
        Ok(Representation {
            payload: Bytes::from(link_format::render(entry.links())),
            content_format: ContentFormat::LINK_FORMAT,
            observe_count: node.observe_count(),
        })
    }

    fn render_post(&self, _node: &ResourceNode, _request: &Request) -> Result<PostOutcome, BrokerError> {
        self.directory.refresh(&self.endpoint)?;
        Ok(PostOutcome::Changed {
            payload: Bytes::new(),
        })
    }

    fn render_put(&self, node: &ResourceNode, _request: &Request) -> Result<(), BrokerError> {
        Err(method_not_allowed(node, Method::Put))
    }

    fn render_delete(&self, _node: &ResourceNode, _request: &Request) -> Result<(), BrokerError> {
        if self.directory.deregister(&self.endpoint).is_err() {
            tracing::debug!(endpoint = %self.endpoint, "registration already gone before resource delete");
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LookupKind {
    /// `rd-lookup`：终端列表，`ep`/`rt` 为可选过滤。
    Endpoints,
    /// `rd-lookup/res`：资源链接列表。
    Resources,
    /// `rd-lookup/ep`：按终端名点查，缺失即 NotFound。
    Endpoint,
}

/// 只读查询资源。
#[derive(Debug)]
pub struct LookupResource {
    directory: Arc<DirectoryService>,
    kind: LookupKind,
}

impl LookupResource {
    fn matching_entries(&self, request: &Request) -> Result<Vec<Arc<DirectoryEntry>>, BrokerError> {
        let ep = request.query_value("ep").filter(|ep| !ep.is_empty());
        if self.kind == LookupKind::Endpoint {
            if let Some(ep) = ep {
                return self.directory.lookup_by_endpoint(ep).map(|entry| vec![entry]);
            }
        }
        let lookup = match request.query_value("rt").filter(|rt| !rt.is_empty()) {
            Some(rt) => self.directory.lookup_by_type(rt),
            None => self.directory.lookup_all(),
        };
        Ok(lookup
            .iter()
            .filter(|entry| ep.is_none_or(|ep| entry.endpoint() == ep))
            .cloned()
            .collect())
    }
}

impl ResourceHandler for LookupResource {
    fn render_get(&self, node: &ResourceNode, request: &Request) -> Result<Representation, BrokerError> {
        let entries = self.matching_entries(request)?;
        let links: Vec<Link> = match self.kind {
            LookupKind::Resources => {
                let rt = request.query_value("rt").filter(|rt| !rt.is_empty());
                entries
                    .iter()
                    .flat_map(|entry| resource_links(entry, rt))
                    .collect()
            }
            LookupKind::Endpoints | LookupKind::Endpoint => entries.iter().map(|entry| endpoint_link(entry)).collect(),
        };
        Ok(Representation {
            payload: Bytes::from(link_format::render(&links)),
            content_format: ContentFormat::LINK_FORMAT,
            observe_count: node.observe_count(),
        })
    }

    fn render_post(&self, node: &ResourceNode, _request: &Request) -> Result<PostOutcome, BrokerError> {
        Err(method_not_allowed(node, Method::Post))
    }

    fn render_put(&self, node: &ResourceNode, _request: &Request) -> Result<(), BrokerError> {
        Err(method_not_allowed(node, Method::Put))
    }

    fn render_delete(&self, node: &ResourceNode, _request: &Request) -> Result<(), BrokerError> {
        Err(method_not_allowed(node, Method::Delete))
    }
}

fn parse_payload(payload: &[u8]) -> Result<Vec<Link>, BrokerError> {
    let text = std::str::from_utf8(payload)
        .map_err(|err| BrokerError::validation(format!("registration payload is not UTF-8: {err}")))?;
    link_format::parse(text)
}

/// 终端描述：`</rd/ep>;ep="..";base="..";lt=..;rt=".."`。
fn endpoint_link(entry: &DirectoryEntry) -> Link {
    let mut link = Link::new(format!("/{}", entry.location()))
        .with_attr("ep", entry.endpoint())
        .with_attr("base", entry.locator().as_str())
        .with_attr("lt", entry.lifetime().as_secs().to_string());
    if !entry.resource_types().is_empty() {
        link = link.with_attr("rt", entry.resource_types().join(" "));
    }
    link
}

/// 终端的资源链接，目标按定位符解析为绝对 URI，并附 `ep` 属性。
fn resource_links(entry: &DirectoryEntry, rt: Option<&str>) -> Vec<Link> {
    entry
        .links()
        .iter()
        .filter(|link| rt.is_none_or(|rt| link.values("rt").any(|value| value == rt)))
        .map(|link| {
            let target = entry
                .locator()
                .join(link.target())
                .map(String::from)
                .unwrap_or_else(|_| link.target().to_owned());
            let mut absolute = Link::new(target);
            for (name, value) in link.attrs() {
                absolute = match value {
                    Some(value) => absolute.with_attr(name, value),
                    None => absolute.with_flag(name),
                };
            }
            absolute.with_attr("ep", entry.endpoint())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::applications::directory::DirectorySettings;

    fn mounted() -> (ResourceNamespace, Arc<DirectoryService>) {
        let namespace = ResourceNamespace::new();
        let directory = Arc::new(DirectoryService::in_memory(DirectorySettings::default()));
        install(&namespace, &directory).expect("install");
        (namespace, directory)
    }

    #[test]
    fn install_mounts_all_entry_points() {
        let (namespace, _directory) = mounted();
        for path in ["/rd", "/rd-lookup", "/rd-lookup/res", "/rd-lookup/ep"] {
            assert!(namespace.resolve(path).is_ok(), "{path} 应当已挂载");
        }
    }

    #[test]
    fn registration_defaults_base_to_request_source() {
        let (namespace, directory) = mounted();
        let rd = namespace.resolve("/rd").expect("rd");
        let source = SocketAddr::from(([192, 0, 2, 10], 5683));
        let request = Request::new(Method::Post, "rd", source)
            .query("ep=node1")
            .payload(&b"</t>;rt=temperature"[..]);
        let outcome = rd
            .handler()
            .expect("handler")
            .render_post(&rd, &request)
            .expect("post");
        assert!(matches!(outcome, PostOutcome::Child { ref name, refreshed: false, .. } if name == "node1"));
        let entry = directory.lookup_by_endpoint("node1").expect("entry");
        assert_eq!(entry.locator().as_str(), "coap://192.0.2.10:5683");
    }

    #[test]
    fn registration_resource_is_observable_and_delete_deregisters() {
        let (namespace, directory) = mounted();
        let rd = namespace.resolve("/rd").expect("rd");
        let source = SocketAddr::from(([192, 0, 2, 10], 5683));
        let request = Request::new(Method::Post, "rd", source).query("ep=node1");
        let outcome = rd
            .handler()
            .expect("handler")
            .render_post(&rd, &request)
            .expect("post");
        let PostOutcome::Child { name, descriptor, .. } = outcome else {
            panic!("registration should create a child");
        };
        assert!(descriptor.observable);
        let node = namespace.insert("/rd", &name, descriptor).expect("mount");

        let delete = Request::new(Method::Delete, "rd/node1", source);
        let handler = node.handler().expect("handler");
        assert_eq!(handler.render_delete(&node, &delete), Ok(()));
        assert!(directory.lookup_by_endpoint("node1").is_err());
        assert_eq!(handler.render_delete(&node, &delete), Ok(()));
    }

    #[test]
    fn resource_lookup_resolves_absolute_targets() {
        let (namespace, directory) = mounted();
        directory
            .register(
                Registration::new("node1", "coap://[2001:db8::1]:5683")
                    .links(link_format::parse(r#"</s/t>;rt="temperature",</s/h>;rt=humidity"#).expect("links")),
            )
            .expect("register");
        let res = namespace.resolve("/rd-lookup/res").expect("res");
        let request = Request::new(Method::Get, "rd-lookup/res", SocketAddr::from(([127, 0, 0, 1], 1)))
            .query("rt=temperature");
        let representation = res
            .handler()
            .expect("handler")
            .render_get(&res, &request)
            .expect("get");
        assert_eq!(
            &representation.payload[..],
            br#"<coap://[2001:db8::1]:5683/s/t>;rt="temperature";ep="node1""#
        );
    }

    #[test]
    fn endpoint_lookup_reports_missing_endpoint() {
        let (namespace, _directory) = mounted();
        let ep = namespace.resolve("/rd-lookup/ep").expect("ep");
        let request = Request::new(Method::Get, "rd-lookup/ep", SocketAddr::from(([127, 0, 0, 1], 1)))
            .query("ep=ghost");
        assert_eq!(
            ep.handler().expect("handler").render_get(&ep, &request).map(|_| ()),
            Err(BrokerError::not_found("rd/ghost"))
        );
    }
}

use async_trait::async_trait;
use pkg_constants::state::SERVICES_PREFIX;
use pkg_state::client::StateStore;
use pkg_types::admission::Operation;
use pkg_types::quota::{ScopedResourceSelectorRequirement, SharedQuota};
use pkg_types::resource::{self as res, Quantity, ResourceList};
use pkg_types::service::{Service, ServiceType};

use crate::generic;
use crate::object::{self, QuotaObject};
use crate::{Evaluator, Result, UsageStats, UsageStatsOptions};

const SERVICE_OBJECT_COUNT: &str = "count/services";

const SERVICE_RESOURCES: &[&str] = &[
    SERVICE_OBJECT_COUNT,
    res::SERVICES,
    res::SERVICES_LOAD_BALANCERS,
    res::SERVICES_NODE_PORTS,
];

pub struct ServiceEvaluator {
    store: StateStore,
}

impl ServiceEvaluator {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Evaluator for ServiceEvaluator {
    fn group_resource(&self) -> &'static str {
        object::SERVICES
    }

    fn constraints(&self, _required: &[String], object: &QuotaObject) -> Result<()> {
        object.as_service().map(|_| ())
    }

    fn handles(&self, operation: Operation) -> bool {
        matches!(operation, Operation::Create | Operation::Update)
    }

    fn matches(&self, quota: &SharedQuota, object: &QuotaObject) -> Result<bool> {
        generic::matches(
            quota,
            object,
            |input| self.matching_resources(input),
            generic::matches_no_scope,
        )
    }

    fn matching_resources(&self, input: &[String]) -> Vec<String> {
        res::intersection(input, SERVICE_RESOURCES)
    }

    fn matching_scopes(
        &self,
        object: &QuotaObject,
        selectors: &[ScopedResourceSelectorRequirement],
    ) -> Result<Vec<ScopedResourceSelectorRequirement>> {
        generic::matching_scopes(object, selectors, generic::matches_no_scope)
    }

    fn usage(&self, object: &QuotaObject) -> Result<ResourceList> {
        Ok(service_usage(object.as_service()?))
    }

    async fn usage_stats(&self, options: &UsageStatsOptions) -> Result<UsageStats> {
        let services = generic::list_namespaced(
            &self.store,
            SERVICES_PREFIX,
            object::SERVICES,
            &options.namespace,
        )
        .await?;
        generic::calculate_usage_stats(options, &services, generic::matches_no_scope, |o| {
            self.usage(o)
        })
    }
}

pub fn service_usage(svc: &Service) -> ResourceList {
    let ports = svc.spec.ports.len() as u64;
    let mut result = ResourceList::new();
    result.insert(SERVICE_OBJECT_COUNT, Quantity::from_units(1));
    result.insert(res::SERVICES, Quantity::from_units(1));
    result.insert(res::SERVICES_LOAD_BALANCERS, Quantity::ZERO);
    result.insert(res::SERVICES_NODE_PORTS, Quantity::ZERO);
    match svc.spec.service_type {
        ServiceType::NodePort => {
            result.insert(res::SERVICES_NODE_PORTS, Quantity::from_units(ports));
        }
        ServiceType::LoadBalancer => {
            // With allocation suppressed only explicitly requested node ports count.
            let node_ports = if svc.spec.allocate_load_balancer_node_ports == Some(false) {
                svc.spec
                    .ports
                    .iter()
                    .filter(|p| p.node_port.is_some_and(|n| n != 0))
                    .count() as u64
            } else {
                ports
            };
            result.insert(res::SERVICES_NODE_PORTS, Quantity::from_units(node_ports));
            result.insert(res::SERVICES_LOAD_BALANCERS, Quantity::from_units(1));
        }
        ServiceType::ClusterIP | ServiceType::ExternalName => {}
    }
    result
}

/// The service type as far as quota cares: only types that consume node
/// ports or load balancers are reported.
pub fn quota_service_type(svc: &Service) -> Option<ServiceType> {
    match svc.spec.service_type {
        t @ (ServiceType::NodePort | ServiceType::LoadBalancer) => Some(t),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::service::{ServicePort, ServiceSpec};

    fn svc(service_type: ServiceType, ports: &[Option<u16>], allocate: Option<bool>) -> Service {
        Service {
            name: "svc".to_string(),
            namespace: "ns".to_string(),
            uid: String::new(),
            labels: Default::default(),
            spec: ServiceSpec {
                ports: ports
                    .iter()
                    .enumerate()
                    .map(|(i, node_port)| ServicePort {
                        name: format!("p{}", i),
                        port: 80 + i as u16,
                        target_port: 8080,
                        node_port: *node_port,
                    })
                    .collect(),
                service_type,
                allocate_load_balancer_node_ports: allocate,
                ..Default::default()
            },
            cluster_ip: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn get(list: &ResourceList, name: &str) -> u64 {
        list.get(name).map(|q| q.value()).unwrap_or(u64::MAX)
    }

    #[test]
    fn cluster_ip_charges_only_the_service() {
        let usage = service_usage(&svc(ServiceType::ClusterIP, &[None, None], None));
        assert_eq!(get(&usage, "services"), 1);
        assert_eq!(get(&usage, "count/services"), 1);
        assert_eq!(get(&usage, "services.nodeports"), 0);
        assert_eq!(get(&usage, "services.loadbalancers"), 0);
    }

    #[test]
    fn node_port_charges_one_per_port() {
        let usage = service_usage(&svc(ServiceType::NodePort, &[None, None, None], None));
        assert_eq!(get(&usage, "services.nodeports"), 3);
        assert_eq!(get(&usage, "services.loadbalancers"), 0);
    }

    #[test]
    fn load_balancer_node_ports_follow_allocation() {
        let usage = service_usage(&svc(ServiceType::LoadBalancer, &[None, None], None));
        assert_eq!(get(&usage, "services.loadbalancers"), 1);
        assert_eq!(get(&usage, "services.nodeports"), 2);

        let suppressed = service_usage(&svc(
            ServiceType::LoadBalancer,
            &[Some(30080), None],
            Some(false),
        ));
        assert_eq!(get(&suppressed, "services.nodeports"), 1);
    }

    #[test]
    fn quota_type_ignores_cluster_ip() {
        assert_eq!(
            quota_service_type(&svc(ServiceType::ClusterIP, &[], None)),
            None
        );
        assert_eq!(
            quota_service_type(&svc(ServiceType::LoadBalancer, &[], None)),
            Some(ServiceType::LoadBalancer)
        );
    }

    #[tokio::test]
    async fn scoped_quotas_never_match_services() {
        let e = ServiceEvaluator::new(StateStore::in_memory().await.unwrap());
        let object = QuotaObject::Service(svc(ServiceType::ClusterIP, &[], None));
        let selectors = vec![ScopedResourceSelectorRequirement::exists(
            pkg_types::quota::ResourceQuotaScope::BestEffort,
        )];
        assert!(e.matching_scopes(&object, &selectors).unwrap().is_empty());
        assert!(e.handles(Operation::Update));
        assert!(!e.handles(Operation::Delete));
    }
}

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod function;
pub mod serving;

pub use self::function::{controller_of, Addressable, Function, FunctionStatus, FunctionView};
pub use k8s_openapi::{
    api::core::v1::{ConfigMap, Service, ServicePort, ServiceSpec},
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams, Resource},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};

/// Label marking a CRD as a function schema managed by this controller.
pub const CRD_LABEL: &str = "functions.knative.dev/crd";

/// Annotation on a function CRD supplying the dispatcher container image.
pub const IMAGE_ANNOTATION: &str = "functions.knative.dev/image";

/// Annotation on a function CRD selecting the convergence policy for the
/// kind. Recognized values: `external-name`, `routed`.
pub const POLICY_ANNOTATION: &str = "functions.knative.dev/policy";

/// Role label stamped on every child resource this controller creates.
pub const ROLE_LABEL: &str = "functions.knative.dev/role";
pub const ROLE_DISPATCHER: &str = "dispatcher";

//! Kubernetes itself: the kubeadm lifecycle and kubectl access to the result.

mod driver;
mod runtime;

pub use driver::{KUBECONFIG, KubeDriver};
pub use runtime::{APISERVER_DOMAIN, APISERVER_PORT, KubeadmRuntime};

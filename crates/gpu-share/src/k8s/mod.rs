pub mod annotations;
pub mod node_lock;
pub mod patcher;
pub mod types;

pub use patcher::init_kube_client;
pub use patcher::AnnotationPatcher;
pub use patcher::KubePatcher;
pub use types::KubernetesError;

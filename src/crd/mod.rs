pub mod autoscaling;
pub mod canary;
pub mod keda;
pub mod knative;

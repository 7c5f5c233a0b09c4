//! Generated CSI protocol definitions
//!
//! The kubelet drives this driver over the Container Storage Interface. The
//! vendored `proto/csi.proto` keeps upstream field numbers so the generated
//! types are wire-compatible with the kubelet's CSI client.

#![allow(missing_docs)] // Generated code doesn't have docs
#![allow(clippy::doc_overindented_list_items)]

tonic::include_proto!("csi.v1");

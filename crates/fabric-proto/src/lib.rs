//! Generated protobuf/gRPC bindings: a minimal etcd v3 (KV/Lease/Watch) subset,
//! and the custom EventServer streaming service.

pub mod mvccpb {
    tonic::include_proto!("mvccpb");
}

pub mod etcdserverpb {
    tonic::include_proto!("etcdserverpb");
}

pub mod eventserver {
    tonic::include_proto!("eventserver");
}

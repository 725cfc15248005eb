//! Single-node scenarios driven through a full `Node`.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use metricd::config::{ColumnConfig, StreamConfig};
use metricd::{Node, NodeConfig};
use metricgrid_cluster::SelectorKind;
use metricgrid_core::{DownSampling, MergeOperator, Record, RoleId, Schema, StageKind, Value, ValueType};
use metricgrid_graph::GraphError;
use metricgrid_storage::Model;

fn config(data_dir: &std::path::Path) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.advertise_addr = Some("127.0.0.1:11800".into());
    config.node.data_dir = data_dir.to_path_buf();
    config.persistence.initial_delay_secs = 3600;
    config.streams = vec![StreamConfig {
        id: 7,
        name: "endpoint_resp_time".into(),
        selector: SelectorKind::HashCode,
        downsampling: vec![DownSampling::Hour],
        support_update: true,
        columns: vec![
            ColumnConfig {
                name: "calls".into(),
                value_type: ValueType::Long,
                merge: MergeOperator::Sum,
            },
            ColumnConfig {
                name: "latency".into(),
                value_type: ValueType::Long,
                merge: MergeOperator::Avg,
            },
            ColumnConfig {
                name: "max_latency".into(),
                value_type: ValueType::Long,
                merge: MergeOperator::Max,
            },
        ],
    }];
    config
}

async fn start(config: NodeConfig) -> Node {
    let grpc = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
    Node::start_with(config, grpc, http).await.unwrap()
}

fn schema(node: &Node) -> Arc<Schema> {
    let role = RoleId::for_stream(7, StageKind::Aggregate).unwrap();
    Arc::clone(node.pipeline().stage(role).unwrap().role().schema())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thousand_samples_persist_to_disk_with_hourly_rollup() {
    let dir = tempfile::tempdir().unwrap();
    let node = start(config(dir.path())).await;
    let schema = schema(&node);

    let mut producers = Vec::new();
    for p in 0..10_i64 {
        let pipeline = Arc::clone(node.pipeline());
        let schema = Arc::clone(&schema);
        producers.push(tokio::task::spawn_blocking(move || {
            for i in 0..100_i64 {
                let latency = p * 100 + i;
                let record = Record::new(Arc::clone(&schema), "GET:/orders", 202401011230)
                    .with("calls", 1_i64)
                    .unwrap()
                    .with("latency", latency)
                    .unwrap()
                    .with("max_latency", latency)
                    .unwrap();
                pipeline.ingest(record).unwrap();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let storage = Arc::clone(node.storage());
    let report = node.stop().await.unwrap();
    assert_eq!(report.stage("endpoint_resp_time").unwrap().inserted, 1);
    assert_eq!(report.stage("endpoint_resp_time_hour").unwrap().inserted, 1);
    assert!(dir.path().join("metricgrid.redb").exists());

    let minute = Model::for_level("endpoint_resp_time", Arc::clone(&schema), DownSampling::Minute);
    let row = storage
        .exists(&minute, "GET:/orders_202401011230", 202401011230)
        .unwrap()
        .unwrap();
    assert_eq!(row.get_by_name("calls"), Some(Value::Long(1000)));
    // Sum of 0..1000 is 499500.
    assert_eq!(row.get_by_name("latency"), Some(Value::Long(499)));
    assert_eq!(row.get_by_name("max_latency"), Some(Value::Long(999)));

    let hour = Model::for_level("endpoint_resp_time", schema, DownSampling::Hour);
    let row = storage
        .exists(&hour, "GET:/orders_2024010112", 2024010112)
        .unwrap()
        .unwrap();
    assert_eq!(row.get_by_name("calls"), Some(Value::Long(1000)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_round_updates_stored_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.node.in_memory_storage = true;
    let node = start(config).await;
    let schema = schema(&node);

    let sample = |latency: i64| {
        Record::new(Arc::clone(&schema), "GET:/users", 202401011230)
            .with("calls", 1_i64)
            .unwrap()
            .with("latency", latency)
            .unwrap()
            .with("max_latency", latency)
            .unwrap()
    };

    node.pipeline().ingest(sample(10)).unwrap();
    assert!(node.pipeline().wait_idle(Duration::from_secs(5)));
    let first = node.pipeline().sweep().sweep_once();
    assert_eq!(first.stage("endpoint_resp_time").unwrap().inserted, 1);

    node.pipeline().ingest(sample(30)).unwrap();
    assert!(node.pipeline().wait_idle(Duration::from_secs(5)));
    let second = node.pipeline().sweep().sweep_once();
    assert_eq!(second.stage("endpoint_resp_time").unwrap().updated, 1);
    assert_eq!(second.stage("endpoint_resp_time_hour").unwrap().updated, 1);

    let minute = Model::for_level("endpoint_resp_time", Arc::clone(&schema), DownSampling::Minute);
    let row = node
        .storage()
        .exists(&minute, "GET:/users_202401011230", 202401011230)
        .unwrap()
        .unwrap();
    assert_eq!(row.get_by_name("calls"), Some(Value::Long(2)));
    assert_eq!(row.get_by_name("latency"), Some(Value::Long(20)));
    assert_eq!(row.get_by_name("max_latency"), Some(Value::Long(30)));

    // Records of an unregistered schema have no entry stage.
    let other = Schema::builder(99, "other")
        .column("v", ValueType::Long, MergeOperator::Sum)
        .build()
        .unwrap();
    let err = node
        .pipeline()
        .ingest(Record::new(other, "x", 202401011230))
        .unwrap_err();
    assert!(matches!(err, GraphError::UnknownSchema(99)));

    node.stop().await.unwrap();
}

#![cfg(test)]

use ntuple_store::comm::ThreadGroup;
use ntuple_store::{
    ByteOrder, Container, CreateMode, DatasetSpec, ElementType, Filter, NodeKind, OpenMode, Values,
};

fn spec() -> DatasetSpec {
    DatasetSpec::new(ElementType::I32, &[2])
        .with_chunk_rows(8)
        .with_byte_order(ByteOrder::Big)
        .with_filters([Filter::Shuffle, Filter::DEFAULT_DEFLATE])
}

#[test]
fn tree_and_data_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.ntpl");
    {
        let container = Container::create(&path, CreateMode::Exclusive).unwrap();
        let events = container.root().create_group("events").unwrap();
        events.set_attribute("run", 42i64).unwrap();
        let hits = events.create_dataset("hits", &spec()).unwrap();
        hits.extend(20).unwrap();
        let values: Vec<i32> = (0..40).collect();
        hits.write_rows(0, &Values::from_slice(&values)).unwrap();
        container.close().unwrap();
    }

    let container = Container::open(&path, OpenMode::ReadOnly).unwrap();
    assert_eq!(
        container.root().members().unwrap(),
        vec![("events".to_string(), NodeKind::Group)]
    );
    let events = container.root().open_group("events").unwrap();
    let hits = events.open_dataset("hits").unwrap();
    assert_eq!(hits.spec().unwrap(), spec());
    assert_eq!(hits.shape().unwrap(), vec![20, 2]);
    assert_eq!(
        hits.read_rows(18, 2).unwrap().to_vec::<i32>().unwrap(),
        vec![36, 37, 38, 39]
    );
}

#[test]
fn reopened_datasets_keep_growing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grow.ntpl");
    {
        let container = Container::create(&path, CreateMode::Exclusive).unwrap();
        let ds = container.root().create_dataset("n", &spec()).unwrap();
        ds.extend(3).unwrap();
        ds.write_rows(0, &Values::from_slice(&[1i32, 1, 2, 2, 3, 3]))
            .unwrap();
    }
    {
        let container = Container::open(&path, OpenMode::ReadWrite).unwrap();
        let ds = container.root().open_dataset("n").unwrap();
        ds.extend(5).unwrap();
        ds.write_rows(3, &Values::from_slice(&[4i32, 4, 5, 5])).unwrap();
    }
    let container = Container::open(&path, OpenMode::ReadOnly).unwrap();
    let all = container
        .root()
        .open_dataset("n")
        .unwrap()
        .read_all()
        .unwrap()
        .to_vec::<i32>()
        .unwrap();
    assert_eq!(all, vec![1, 1, 2, 2, 3, 3, 4, 4, 5, 5]);
}

#[test]
fn workers_write_disjoint_ranges_of_one_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let container =
        Container::create(dir.path().join("shared.ntpl"), CreateMode::Exclusive).unwrap();
    let ds = container
        .root()
        .create_dataset("rank", &DatasetSpec::new(ElementType::U64, &[]).with_chunk_rows(4))
        .unwrap();
    ds.extend(4 * 10).unwrap();

    ThreadGroup::run(4, |comm| {
        use ntuple_store::comm::Communicator;
        let start = (comm.rank() * 10) as u64;
        ds.write_rows(start, &Values::from_slice(&[comm.rank() as u64; 10]))
            .unwrap();
        comm.barrier();
    });

    let all = ds.read_all().unwrap().to_vec::<u64>().unwrap();
    for (row, value) in all.iter().enumerate() {
        assert_eq!(*value, (row / 10) as u64);
    }
}

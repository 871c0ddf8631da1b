use std::fmt::Write;
use std::path::Path;

use itertools::Itertools;
use ntuple_store::{Container, Group, NodeKind, OpenMode};

pub fn exec_tree(file: impl AsRef<Path>) -> anyhow::Result<()> {
    let container = Container::open(file, OpenMode::ReadOnly)?;
    print!("{}", render_tree(&container)?);
    Ok(())
}

fn render_tree(container: &Container) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(out, "/")?;
    render_group(&container.root(), 1, &mut out)?;
    Ok(out)
}

fn render_group(group: &Group, depth: usize, out: &mut String) -> anyhow::Result<()> {
    let indent = "  ".repeat(depth);
    for (key, value) in group.attributes()? {
        writeln!(out, "{indent}@{key} = {value}")?;
    }
    for (name, kind) in group.members()? {
        match kind {
            NodeKind::Group => {
                writeln!(out, "{indent}{name}/")?;
                render_group(&group.open_group(&name)?, depth + 1, out)?;
            }
            NodeKind::Dataset => {
                let dataset = group.open_dataset(&name)?;
                writeln!(
                    out,
                    "{indent}{name}: ({}) {}",
                    dataset.shape()?.iter().join(", "),
                    dataset.spec()?
                )?;
                for (key, value) in dataset.attributes()? {
                    writeln!(out, "{indent}  @{key} = {value}")?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ntuple_store::{ByteOrder, CreateMode, DatasetSpec, ElementType, Filter};

    use super::*;

    #[test]
    fn shows_hierarchy_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let container =
            Container::create(dir.path().join("t.ntpl"), CreateMode::Exclusive).unwrap();
        let run = container.root().create_group("run1").unwrap();
        run.set_attribute("energy", 13.6).unwrap();
        let spec = DatasetSpec::new(ElementType::F32, &[3])
            .with_byte_order(ByteOrder::Little)
            .with_chunk_rows(16)
            .with_filters([Filter::Shuffle, Filter::DEFAULT_DEFLATE]);
        let hits = run.create_dataset("hits", &spec).unwrap();
        hits.extend(40).unwrap();

        let tree = render_tree(&container).unwrap();
        assert_eq!(
            tree,
            "/\n  run1/\n    @energy = 13.6\n    hits: (40, 3) f32:le (∞, 3) chunked by 16 [shuffle, deflate(6)]\n"
        );
    }
}

use anyhow::{Context, Result};
use async_recursion::async_recursion;
use common::pipeline::Submitter;
use common::CopyRequest;

/// Paths never enqueued as sources: the output files and the destination root itself
#[derive(Debug, Clone, Default)]
pub struct Excludes {
    paths: Vec<std::path::PathBuf>,
}

impl Excludes {
    pub fn new(paths: impl IntoIterator<Item = std::path::PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    pub fn contains(&self, path: &std::path::Path) -> bool {
        self.paths.iter().any(|excluded| excluded == path)
    }
}

#[async_recursion]
async fn enqueue_dir(
    submitter: &Submitter<CopyRequest>,
    src: &std::path::Path,
    dst: &std::path::Path,
    excludes: &Excludes,
) -> Result<usize> {
    let mut entries = tokio::fs::read_dir(src)
        .await
        .with_context(|| format!("cannot open directory {src:?} for reading"))?;
    let mut enqueued = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {src:?}"))?
    {
        if submitter.is_stopped() {
            tracing::debug!("stop requested, no longer enumerating {:?}", src);
            break;
        }
        let entry_path = entry.path();
        if excludes.contains(&entry_path) {
            tracing::debug!("not copying {:?}", &entry_path);
            continue;
        }
        let dst_path = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("failed reading file type of {entry_path:?}"))?;
        if file_type.is_dir() {
            enqueued += enqueue_dir(submitter, &entry_path, &dst_path, excludes).await?;
            continue;
        }
        // anything that is not a regular file is rejected by the copier with a warning
        if !submitter
            .submit(CopyRequest::new(entry_path, dst_path))
            .await?
        {
            break;
        }
        enqueued += 1;
    }
    Ok(enqueued)
}

/// Enqueue one copy request per file under `src`, mirroring the tree under `dst`.
///
/// A `src` that is not a directory is copied to `dst`, or into it if `dst` is an existing
/// directory. Returns the number of requests enqueued; enumeration ends early once the stop signal
/// is raised.
pub async fn enqueue(
    submitter: &Submitter<CopyRequest>,
    src: &std::path::Path,
    dst: &std::path::Path,
    excludes: &Excludes,
) -> Result<usize> {
    let src_metadata = tokio::fs::metadata(src)
        .await
        .with_context(|| format!("cannot read source {src:?}"))?;
    if src_metadata.is_dir() {
        return enqueue_dir(submitter, src, dst, excludes).await;
    }
    let dst = match (tokio::fs::metadata(dst).await, src.file_name()) {
        (Ok(dst_metadata), Some(name)) if dst_metadata.is_dir() => dst.join(name),
        _ => dst.to_owned(),
    };
    let enqueued = submitter.submit(CopyRequest::new(src, dst)).await?;
    Ok(usize::from(enqueued))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn pipeline(stop: CancellationToken, dst: &std::path::Path) -> common::CopyPipeline {
        common::CopyPipeline::start(
            &common::PipelineConfig {
                copy_workers: 2,
                verify_workers: 1,
                queue_capacity: 0,
            },
            common::copy::Settings {
                full_copy: false,
                algorithm: common::Algorithm::Sha256,
                manifest: dst.join("checksum.sha256"),
                csv: dst.join("checksum.csv"),
            },
            stop,
            std::sync::Arc::new(common::progress::Progress::new()),
        )
    }

    #[tokio::test]
    async fn mirrors_tree_and_skips_outputs() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let src = tmp_dir.path().join("src");
        tokio::fs::create_dir_all(src.join("nested").join("deeper")).await?;
        tokio::fs::write(src.join("a.txt"), "a").await?;
        tokio::fs::write(src.join("nested").join("b.txt"), "b").await?;
        tokio::fs::write(src.join("nested").join("deeper").join("c.txt"), "c").await?;
        // a manifest living inside the source tree is not itself copied
        tokio::fs::write(src.join("checksum.sha256"), "").await?;
        let dst = tmp_dir.path().join("dst");
        let pipeline = pipeline(CancellationToken::new(), &dst);
        let excludes = Excludes::new([src.join("checksum.sha256")]);
        let enqueued = enqueue(&pipeline.submitter(), &src, &dst, &excludes).await?;
        assert_eq!(enqueued, 3);
        let summary = pipeline.finish().await?;
        assert_eq!(summary.files_copied, 3);
        assert_eq!(
            tokio::fs::read_to_string(dst.join("nested").join("deeper").join("c.txt")).await?,
            "c"
        );
        let manifest = tokio::fs::read_to_string(dst.join("checksum.sha256")).await?;
        let mut paths: Vec<_> = manifest
            .lines()
            .map(|line| common::manifest::ManifestEntry::parse(line).map(|entry| entry.path))
            .collect::<Result<_, _>>()?;
        paths.sort();
        assert_eq!(paths, ["a.txt", "nested/b.txt", "nested/deeper/c.txt"]);
        Ok(())
    }

    #[tokio::test]
    async fn single_file_into_existing_directory() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let src = tmp_dir.path().join("only.txt");
        tokio::fs::write(&src, "only").await?;
        let dst = tmp_dir.path().join("dst");
        tokio::fs::create_dir(&dst).await?;
        let pipeline = pipeline(CancellationToken::new(), &dst);
        let enqueued = enqueue(&pipeline.submitter(), &src, &dst, &Excludes::default()).await?;
        assert_eq!(enqueued, 1);
        pipeline.finish().await?;
        assert_eq!(tokio::fs::read_to_string(dst.join("only.txt")).await?, "only");
        Ok(())
    }

    #[tokio::test]
    async fn nothing_enqueued_after_stop() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let src = tmp_dir.path().join("src");
        tokio::fs::create_dir(&src).await?;
        for i in 0..5 {
            tokio::fs::write(src.join(format!("{i}.txt")), "x").await?;
        }
        let dst = tmp_dir.path().join("dst");
        let stop = CancellationToken::new();
        stop.cancel();
        let pipeline = pipeline(stop, &dst);
        let enqueued = enqueue(&pipeline.submitter(), &src, &dst, &Excludes::default()).await?;
        assert_eq!(enqueued, 0);
        let summary = pipeline.finish().await?;
        assert_eq!(summary.files_copied, 0);
        assert!(!dst.exists());
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_is_an_error() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let dst = tmp_dir.path().join("dst");
        let pipeline = pipeline(CancellationToken::new(), &dst);
        let res = enqueue(
            &pipeline.submitter(),
            &tmp_dir.path().join("nope"),
            &dst,
            &Excludes::default(),
        )
        .await;
        assert!(res.is_err());
        pipeline.finish().await?;
        Ok(())
    }
}

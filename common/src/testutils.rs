#[cfg(test)]
pub async fn create_temp_dir() -> anyhow::Result<std::path::PathBuf> {
    let mut idx = 0;
    loop {
        let tmp_dir = std::env::temp_dir().join(format!("copytool_test{}", &idx));
        if let Err(error) = tokio::fs::create_dir(&tmp_dir).await {
            match error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    idx += 1;
                }
                _ => return Err(error.into()),
            }
        } else {
            return Ok(tmp_dir);
        }
    }
}

#[cfg(test)]
pub async fn setup_test_dir() -> anyhow::Result<std::path::PathBuf> {
    // create a temporary directory
    let tmp_dir = create_temp_dir().await?;
    // src
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    // |- baz
    //    |- qux
    //       |- 3.txt
    let src_path = tmp_dir.join("src");
    tokio::fs::create_dir(&src_path).await?;
    tokio::fs::write(src_path.join("0.txt"), "0").await?;
    let bar_path = src_path.join("bar");
    tokio::fs::create_dir(&bar_path).await?;
    tokio::fs::write(bar_path.join("1.txt"), "1").await?;
    tokio::fs::write(bar_path.join("2.txt"), "2").await?;
    let qux_path = src_path.join("baz").join("qux");
    tokio::fs::create_dir_all(&qux_path).await?;
    tokio::fs::write(qux_path.join("3.txt"), "3").await?;
    Ok(tmp_dir)
}

/// Move the mtime of `path` by `offset_secs` relative to its current value
#[cfg(test)]
pub fn shift_mtime(path: &std::path::Path, offset_secs: i64) -> anyhow::Result<()> {
    let metadata = std::fs::metadata(path)?;
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    let shifted = filetime::FileTime::from_unix_time(
        mtime.unix_seconds() + offset_secs,
        mtime.nanoseconds(),
    );
    filetime::set_file_mtime(path, shifted)?;
    Ok(())
}

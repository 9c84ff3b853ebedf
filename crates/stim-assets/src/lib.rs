use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use std::fs;
use std::path::{Path, PathBuf};
use stim_core::{atomic_write_bytes, Error, Result};

/// Image formats accepted as stimuli, matched case-insensitively.
pub const ACCEPTED_EXTENSIONS: [&str; 5] = ["tif", "tiff", "png", "jpg", "jpeg"];

pub const ASSETS_FILE: &str = "assets.txt";

pub type AssetList = Vec<String>;

pub fn is_accepted_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lowered = e.to_ascii_lowercase();
            ACCEPTED_EXTENSIONS.iter().any(|a| *a == lowered)
        })
        .unwrap_or(false)
}

/// Scan `source_folder` (non-recursive) for accepted images and return their
/// stems sorted lexicographically. Randomization is a separate step.
pub fn generate(source_folder: &Path) -> Result<AssetList> {
    if !source_folder.is_dir() {
        return Err(Error::NotFound(format!(
            "asset source folder not found: {}",
            source_folder.display()
        )));
    }
    let mut identifiers = Vec::new();
    for entry in fs::read_dir(source_folder)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() || !is_accepted_image(&path) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            identifiers.push(stem.to_string());
        }
    }
    if identifiers.is_empty() {
        return Err(Error::EmptySource(source_folder.display().to_string()));
    }
    identifiers.sort();
    Ok(identifiers)
}

/// Uniform permutation from the operating system CSPRNG. Presentation order
/// must stay unpredictable to the participant, so a seeded generator is out.
pub fn shuffle(list: &mut [String]) -> Result<()> {
    if list.is_empty() {
        return Err(Error::EmptyList);
    }
    list.shuffle(&mut OsRng);
    Ok(())
}

/// One identifier per line, newline-terminated, UTF-8.
pub fn persist(list: &[String], path: &Path) -> Result<()> {
    let mut content = String::new();
    for identifier in list {
        content.push_str(identifier);
        content.push('\n');
    }
    atomic_write_bytes(path, content.as_bytes())
}

/// Blank lines are skipped; order is preserved.
pub fn load(path: &Path) -> Result<AssetList> {
    if !path.exists() {
        return Err(Error::NotFound(format!(
            "asset list not found: {}",
            path.display()
        )));
    }
    let raw = fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect())
}

/// Copy accepted images from `source` into `objects_dir`, returning how many
/// files were imported.
pub fn import(source: &Path, objects_dir: &Path) -> Result<usize> {
    if !source.is_dir() {
        return Err(Error::NotFound(format!(
            "import source not found: {}",
            source.display()
        )));
    }
    stim_core::ensure_dir(objects_dir)?;
    let mut copied = 0;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && is_accepted_image(&path) {
            let name = path
                .file_name()
                .ok_or_else(|| Error::Operational(format!("unnamed file: {}", path.display())))?;
            fs::copy(&path, objects_dir.join(name))?;
            copied += 1;
        }
    }
    tracing::info!(count = copied, dest = %objects_dir.display(), "imported image assets");
    Ok(copied)
}

/// Map an identifier back to a file in `objects_dir` by probing the accepted
/// extensions in declaration order.
pub fn resolve_stimulus(objects_dir: &Path, identifier: &str) -> Result<PathBuf> {
    for ext in ACCEPTED_EXTENSIONS {
        let candidate = objects_dir.join(format!("{}.{}", identifier, ext));
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(Error::NotFound(format!(
        "no image file for identifier '{}' in {}",
        identifier,
        objects_dir.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "stimlab_assets_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"img").expect("touch");
    }

    #[test]
    fn generate_filters_extensions_and_strips_them() {
        let dir = scratch_dir("gen");
        touch(&dir, "a.png");
        touch(&dir, "b.tif");
        touch(&dir, "c.txt");
        touch(&dir, "d.JPG");
        fs::create_dir(dir.join("nested")).expect("nested");
        touch(&dir.join("nested"), "e.png");

        let list = generate(&dir).expect("generate");
        assert_eq!(list, vec!["a", "b", "d"]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn generate_fails_on_missing_folder() {
        let dir = scratch_dir("missing").join("nowhere");
        let err = generate(&dir).expect_err("must fail");
        assert!(matches!(err, Error::NotFound(_)), "got: {}", err);
    }

    #[test]
    fn generate_fails_on_folder_without_images() {
        let dir = scratch_dir("noimg");
        touch(&dir, "notes.txt");
        let err = generate(&dir).expect_err("must fail");
        assert!(matches!(err, Error::EmptySource(_)), "got: {}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn shuffle_preserves_the_multiset() {
        let mut list: Vec<String> = (0..50).map(|i| format!("stim_{:02}", i)).collect();
        let before = list.clone();
        shuffle(&mut list).expect("shuffle");
        assert_eq!(list.len(), before.len());
        let mut counts: BTreeMap<&String, usize> = BTreeMap::new();
        for item in &list {
            *counts.entry(item).or_default() += 1;
        }
        for item in &before {
            assert_eq!(counts.get(item), Some(&1), "lost identifier {}", item);
        }
    }

    #[test]
    fn shuffle_rejects_an_empty_list() {
        let mut list: Vec<String> = Vec::new();
        let err = shuffle(&mut list).expect_err("must fail");
        assert!(matches!(err, Error::EmptyList));
    }

    #[test]
    fn persist_then_load_round_trips_order() {
        let dir = scratch_dir("roundtrip");
        let path = dir.join(ASSETS_FILE);
        let list = vec!["zebra".to_string(), "apple".to_string(), "mango".to_string()];
        persist(&list, &path).expect("persist");
        let raw = fs::read_to_string(&path).expect("raw");
        assert!(raw.ends_with('\n'), "file must be newline-terminated");
        let loaded = load(&path).expect("load");
        assert_eq!(loaded, list);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_skips_blank_lines() {
        let dir = scratch_dir("blank");
        let path = dir.join(ASSETS_FILE);
        fs::write(&path, "one\n\n  \ntwo\n").expect("write");
        let loaded = load(&path).expect("load");
        assert_eq!(loaded, vec!["one", "two"]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_fails_when_file_is_absent() {
        let dir = scratch_dir("absent");
        let err = load(&dir.join(ASSETS_FILE)).expect_err("must fail");
        assert!(matches!(err, Error::NotFound(_)));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn import_copies_only_accepted_images() {
        let dir = scratch_dir("import");
        let source = dir.join("incoming");
        let objects = dir.join("OBJECTS");
        fs::create_dir_all(&source).expect("source");
        touch(&source, "x.png");
        touch(&source, "y.tiff");
        touch(&source, "skip.pdf");

        let copied = import(&source, &objects).expect("import");
        assert_eq!(copied, 2);
        assert!(objects.join("x.png").exists());
        assert!(objects.join("y.tiff").exists());
        assert!(!objects.join("skip.pdf").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn resolve_stimulus_probes_accepted_extensions() {
        let dir = scratch_dir("resolve");
        touch(&dir, "face01.jpeg");
        let path = resolve_stimulus(&dir, "face01").expect("resolve");
        assert_eq!(path, dir.join("face01.jpeg"));
        let err = resolve_stimulus(&dir, "face02").expect_err("must fail");
        assert!(matches!(err, Error::NotFound(_)));
        let _ = fs::remove_dir_all(dir);
    }
}

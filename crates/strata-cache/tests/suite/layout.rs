use url::Url;

use strata_cache::{
    ArtifactStore, CacheConfig, CacheDir, CheckSums, FqnStore, FsArtifactStore,
};
use strata_core::{DeclaredElement, ElementKind, Modifier, RootUrl};

#[test]
fn root_directory_holds_every_store() {
    let temp = tempfile::tempdir().unwrap();
    let cache = CacheDir::new(CacheConfig {
        cache_root_override: Some(temp.path().to_path_buf()),
    })
    .unwrap();
    let root = RootUrl::parse("file:///work/app/src/").unwrap();
    let dir = cache.root_dir(&root);
    dir.create().unwrap();

    let file = Url::parse("file:///work/app/src/p/A.java").unwrap();
    let declared = [DeclaredElement::new(ElementKind::Class, "p.A")
        .with_modifiers([Modifier::Public])];

    let mut sums = CheckSums::load(dir.checksums_path()).unwrap();
    sums.check_and_set(&file, &declared);
    sums.store().unwrap();

    let mut fqns = FqnStore::load(dir.fqn_path()).unwrap();
    fqns.set(["p.A"], &file);
    fqns.store().unwrap();

    let artifacts = FsArtifactStore::new(dir.classes_dir());
    artifacts.write_artifact("p.A", b"sig").unwrap();
    artifacts.write_manifest("p/A.java", &["p.A".into()]).unwrap();

    for path in [dir.checksums_path(), dir.fqn_path()] {
        assert!(path.is_file(), "{} missing", path.display());
    }
    assert!(dir.classes_dir().join("p/A.sig").is_file());
    assert!(dir.classes_dir().join("p/A.rs").is_file());
    assert!(dir.path().starts_with(temp.path().join("roots")));

    // Storing unchanged stores again must not rewrite them.
    let before = std::fs::metadata(dir.checksums_path()).unwrap().modified().unwrap();
    let mut sums = CheckSums::load(dir.checksums_path()).unwrap();
    assert!(sums.check_and_set(&file, &declared));
    sums.store().unwrap();
    let after = std::fs::metadata(dir.checksums_path()).unwrap().modified().unwrap();
    assert_eq!(before, after);
}

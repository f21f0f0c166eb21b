use doxygen_service::pack::{compress, pack};
use doxygen_service::unpack::extract;
use std::fs;
use tempfile::tempdir;

/// A generated tree packed by the service unpacks to the same files.
#[test]
fn packed_output_extracts_to_the_same_tree() {
    let work = tempdir().unwrap();
    let html = work.path().join("html");
    fs::create_dir_all(html.join("search")).unwrap();
    fs::write(html.join("index.html"), "<html>index</html>").unwrap();
    fs::write(html.join("search/all_0.js"), "var searchData=[];").unwrap();
    fs::create_dir(html.join("empty")).unwrap();

    let packed = pack(&html, work.path()).expect("pack");
    assert_eq!(packed.path, work.path().join("html.tar"));
    assert_eq!(packed.skipped, 0);

    let compressed = compress(&packed.path, work.path()).expect("compress");
    assert_eq!(compressed, work.path().join("html.tar.gz"));

    let out = tempdir().unwrap();
    let summary = extract(fs::File::open(&compressed).unwrap(), out.path()).expect("extract");
    assert_eq!(summary.files, 2);
    assert_eq!(summary.directories, 3);

    assert_eq!(
        fs::read_to_string(out.path().join("html/index.html")).unwrap(),
        "<html>index</html>"
    );
    assert_eq!(
        fs::read_to_string(out.path().join("html/search/all_0.js")).unwrap(),
        "var searchData=[];"
    );
    assert!(out.path().join("html/empty").is_dir());
}

#[cfg(unix)]
#[test]
fn permission_bits_survive_the_round_trip() {
    use std::os::unix::fs::PermissionsExt;

    let work = tempdir().unwrap();
    let html = work.path().join("html");
    fs::create_dir(&html).unwrap();
    let script = html.join("run.sh");
    fs::write(&script, "#!/bin/sh\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o750)).unwrap();
    let page = html.join("page.html");
    fs::write(&page, "page").unwrap();
    fs::set_permissions(&page, fs::Permissions::from_mode(0o640)).unwrap();

    let packed = pack(&html, work.path()).unwrap();
    let compressed = compress(&packed.path, work.path()).unwrap();

    let out = tempdir().unwrap();
    extract(fs::File::open(&compressed).unwrap(), out.path()).unwrap();

    let mode = |p: &str| fs::metadata(out.path().join(p)).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode("html/run.sh"), 0o750);
    assert_eq!(mode("html/page.html"), 0o640);
}

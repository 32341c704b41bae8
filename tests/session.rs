//! Session behaviour against a backend that needs no hypervisor.

use std::fs;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vm_appliance::tmpdir::TempDirs;
use vm_appliance::{
    AddDriveOptions, Backend, BackendRegistry, Connection, Drive, Error, ErrorKind, LaunchContext,
    Launched, Result, Session, SessionConfig,
};

/// Settings and counters shared by every instance of the mock backend.
#[derive(Default)]
struct Mock {
    launches: AtomicUsize,
    overlays: AtomicUsize,
    /// Launches numbered up to this one fail.
    failures: usize,
    max_disks: Option<usize>,
    appliance_drive: bool,
}

struct MockBackend {
    mock: Arc<Mock>,
    peer: Option<UnixStream>,
}

impl Backend for MockBackend {
    fn launch(&mut self, ctx: &mut LaunchContext<'_>, _arg: Option<&str>) -> Result<Launched> {
        let attempt = self.mock.launches.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.send_progress(0);
        if attempt <= self.mock.failures {
            return Err(Error::launch_failed(ctx.verbose()));
        }

        let (ours, theirs) = UnixStream::pair()?;
        self.peer = Some(theirs);
        Ok(Launched {
            connection: Connection::connected(ours, None)?,
            appliance_drive: self.mock.appliance_drive,
        })
    }

    fn create_cow_overlay(&mut self, tmpdirs: &mut TempDirs, _drive: &Drive) -> Result<PathBuf> {
        let path = tmpdirs.make_temp_path("overlay", Some("qcow2"))?;
        fs::File::create(&path)?;
        self.mock.overlays.fetch_add(1, Ordering::SeqCst);
        Ok(path)
    }

    fn max_disks(&self) -> Result<usize> {
        self.mock
            .max_disks
            .ok_or_else(|| Error::NotSupported("no limit".to_string()))
    }
}

fn session_with(dir: &Path, mock: &Arc<Mock>) -> Session {
    let mut registry = BackendRegistry::with_defaults();
    let shared = Arc::clone(mock);
    registry.register("mock", move |_: &SessionConfig| {
        Box::new(MockBackend {
            mock: Arc::clone(&shared),
            peer: None,
        }) as Box<dyn Backend>
    });

    let config = SessionConfig {
        backend: "mock".to_string(),
        tmpdir: dir.to_path_buf(),
        ..Default::default()
    };
    Session::new(Arc::new(registry), config).unwrap()
}

fn remote(protocol: &str, servers: &[&str]) -> AddDriveOptions {
    AddDriveOptions {
        protocol: Some(protocol.to_string()),
        server: servers.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn disk_image(dir: &Path) -> String {
    let path = dir.join("disk.img");
    fs::write(&path, vec![0u8; 4096]).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn launch_moves_to_ready_once() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(Mock::default());
    let mut session = session_with(dir.path(), &mock);

    session.add_drive("/dev/null", &AddDriveOptions::default()).unwrap();
    session.launch().unwrap();
    assert!(session.is_ready());
    assert!(session.connection().is_ok());

    assert!(matches!(session.launch(), Err(Error::InvalidState(_))));
    assert_eq!(mock.launches.load(Ordering::SeqCst), 1);
    assert!(session.is_ready());

    let err = session
        .add_drive("/dev/null", &AddDriveOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("hotplugging"));
    assert!(matches!(session.set_backend("direct"), Err(Error::InvalidState(_))));

    // The mock has no process to report.
    assert_eq!(session.get_pid().unwrap_err().kind(), ErrorKind::Capability);
    session.shutdown().unwrap();
}

#[test]
fn server_count_per_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_with(dir.path(), &Arc::new(Mock::default()));

    let single = [
        ("ftp", "/disk.img"),
        ("ftps", "/disk.img"),
        ("http", "/disk.img"),
        ("https", "/disk.img"),
        ("tftp", "/disk.img"),
        ("ssh", "/disk.img"),
        ("gluster", "volume/image"),
        ("iscsi", "iqn.2015-01.com.example:storage/0"),
        ("nbd", "export"),
    ];
    for (protocol, exportname) in single {
        for servers in [&[][..], &["a.example.com", "b.example.com"][..]] {
            let err = session
                .add_drive(exportname, &remote(protocol, servers))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{protocol}");
        }
        session
            .add_drive(exportname, &remote(protocol, &["a.example.com:1234"]))
            .unwrap_or_else(|e| panic!("{protocol}: {e}"));
    }

    for (protocol, exportname) in [("rbd", "pool/image"), ("sheepdog", "volume")] {
        assert!(session.add_drive(exportname, &remote(protocol, &[])).is_err());
        session
            .add_drive(
                exportname,
                &remote(protocol, &["a.example.com:6789", "b.example.com:6789"]),
            )
            .unwrap_or_else(|e| panic!("{protocol}: {e}"));
    }

    assert_eq!(session.drives().len(), single.len() + 2);
}

#[test]
fn credentials_only_where_supported() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_with(dir.path(), &Arc::new(Mock::default()));

    let with_auth = |mut opts: AddDriveOptions| {
        opts.username = Some("admin".to_string());
        opts.secret = Some("hunter2".to_string());
        opts
    };

    for (protocol, exportname, server) in [
        ("nbd", "export", "nbd.example.com:10809"),
        ("gluster", "volume/image", "gluster.example.com"),
        ("sheepdog", "volume", "sheep.example.com:7000"),
    ] {
        let err = session
            .add_drive(exportname, &with_auth(remote(protocol, &[server])))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDrive(_)), "{protocol}: {err}");
    }
    assert_eq!(session.drives().len(), 0);

    let index = session
        .add_drive("/disk.img", &with_auth(remote("ssh", &["ssh.example.com"])))
        .unwrap();
    let drive = session.drives().get(index).unwrap();
    assert_eq!(drive.source.username.as_deref(), Some("admin"));
    assert_eq!(drive.source.secret.as_deref(), Some("hunter2"));

    session
        .add_drive(
            "iqn.2015-01.com.example:storage/0",
            &with_auth(remote("iscsi", &["iscsi.example.com:3260"])),
        )
        .unwrap();
}

#[test]
fn path_prefix_rules() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_with(dir.path(), &Arc::new(Mock::default()));

    let rejected = [
        ("ftp", "disk.img", "ftp.example.com"),
        ("http", "disk.img", "web.example.com"),
        ("https", "disk.img", "web.example.com"),
        ("ssh", "disk.img", "ssh.example.com"),
        ("gluster", "/volume/image", "gluster.example.com"),
        ("iscsi", "/iqn.2015-01.com.example:storage/0", "iscsi.example.com"),
        ("rbd", "/pool/image", "mon.example.com:6789"),
        ("sheepdog", "/volume", "sheep.example.com:7000"),
        ("sheepdog", "", "sheep.example.com:7000"),
    ];
    for (protocol, exportname, server) in rejected {
        let err = session
            .add_drive(exportname, &remote(protocol, &[server]))
            .unwrap_err();
        assert!(
            err.to_string().starts_with(protocol),
            "{protocol}: unexpected message '{err}'"
        );
    }
    assert_eq!(session.drives().len(), 0);
}

#[test]
fn readonly_drives_get_an_overlay() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(Mock::default());
    let mut session = session_with(dir.path(), &mock);
    let image = disk_image(dir.path());

    let index = session.add_drive_ro(&image).unwrap();
    let drive = session.drives().get(index).unwrap();
    assert!(drive.readonly);
    let overlay = drive.overlay.clone().unwrap();
    assert!(overlay.exists());
    assert_eq!(mock.overlays.load(Ordering::SeqCst), 1);

    // /dev/null is replaced by a throwaway image, which needs no overlay.
    let index = session.add_drive_ro("/dev/null").unwrap();
    let drive = session.drives().get(index).unwrap();
    assert!(!drive.readonly);
    assert!(drive.overlay.is_none());
    assert_eq!(drive.source.format.as_deref(), Some("raw"));
    assert_eq!(mock.overlays.load(Ordering::SeqCst), 1);

    drop(session);
    assert!(!overlay.exists());
}

#[test]
fn readonly_needs_backend_support() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_with(dir.path(), &Arc::new(Mock::default()));
    session.set_backend("unix:/run/nowhere.sock").unwrap();

    let err = session.add_drive_ro(&disk_image(dir.path())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert_eq!(session.last_error().unwrap().errno, Some(nix::libc::ENOTSUP));
    assert_eq!(session.drives().len(), 0);

    session
        .add_drive(&disk_image(dir.path()), &AddDriveOptions::default())
        .unwrap();
}

#[test]
fn discard_conflicts_with_readonly() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(Mock::default());
    let mut session = session_with(dir.path(), &mock);

    let opts = AddDriveOptions {
        readonly: true,
        discard: Some("enable".to_string()),
        ..Default::default()
    };
    let err = session.add_drive(&disk_image(dir.path()), &opts).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(session.drives().len(), 0);
    assert_eq!(mock.overlays.load(Ordering::SeqCst), 0);

    let opts = AddDriveOptions {
        readonly: true,
        discard: Some("besteffort".to_string()),
        ..Default::default()
    };
    session.add_drive(&disk_image(dir.path()), &opts).unwrap();
}

#[test]
fn atomic_add_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_with(dir.path(), &Arc::new(Mock::default()));
    session.add_drive("/dev/null", &AddDriveOptions::default()).unwrap();

    let result = session.add_drives_atomic([
        ("/dev/null", AddDriveOptions::default()),
        ("/dev/null", AddDriveOptions::default()),
        ("export", remote("nbd", &[])),
    ]);
    assert!(result.is_err());
    assert_eq!(session.drives().len(), 1);

    let added = session
        .add_drives_atomic([
            ("/dev/null", AddDriveOptions::default()),
            ("export", remote("nbd", &["nbd.example.com"])),
        ])
        .unwrap();
    assert_eq!(added, vec![1, 2]);

    let mark = session.checkpoint();
    session.add_drive("/dev/null", &AddDriveOptions::default()).unwrap();
    session.rollback(mark).unwrap();
    assert_eq!(session.drives().len(), 3);
}

#[test]
fn rollback_is_refused_once_launched() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(Mock {
        appliance_drive: true,
        ..Default::default()
    });
    let mut session = session_with(dir.path(), &mock);
    let mark = session.checkpoint();
    session.add_drive("/dev/null", &AddDriveOptions::default()).unwrap();
    session.launch().unwrap();
    assert_eq!(session.drives().len(), 2);

    assert!(matches!(session.rollback(mark), Err(Error::InvalidState(_))));
    assert!(session.last_error().unwrap().message.contains("rollback"));
    assert!(session.is_ready());
    assert_eq!(session.drives().len(), 2);
    assert!(session.drives().get(1).unwrap().is_dummy());
}

#[test]
fn too_many_drives_stops_launch() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(Mock {
        max_disks: Some(2),
        ..Default::default()
    });
    let mut session = session_with(dir.path(), &mock);
    for _ in 0..3 {
        session.add_drive("/dev/null", &AddDriveOptions::default()).unwrap();
    }

    assert!(matches!(session.launch(), Err(Error::TooManyDrives(2))));
    assert_eq!(mock.launches.load(Ordering::SeqCst), 0);
    assert!(session.is_config());
}

#[test]
fn failed_launch_can_be_retried() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(Mock {
        failures: 1,
        ..Default::default()
    });
    let mut session = session_with(dir.path(), &mock);
    session.add_drive("/dev/null", &AddDriveOptions::default()).unwrap();

    let err = session.launch().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(session.is_config());
    assert!(session.connection().is_err());
    assert!(session
        .last_error()
        .unwrap()
        .message
        .starts_with("launch failed"));

    session.launch().unwrap();
    assert!(session.is_ready());
    assert_eq!(mock.launches.load(Ordering::SeqCst), 2);
}

#[test]
fn last_error_keeps_errno() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_with(dir.path(), &Arc::new(Mock::default()));

    let missing = dir.path().join("missing.img");
    let err = session
        .add_drive(&missing.to_string_lossy(), &AddDriveOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);

    let last = session.last_error().unwrap();
    assert_eq!(last.errno, Some(nix::libc::ENOENT));
    assert_eq!(last.message, err.to_string());
}

#[test]
fn fast_launch_reports_no_progress() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_with(dir.path(), &Arc::new(Mock::default()));
    let reported = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reported);
    session.set_progress_callback(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    session.add_drive("/dev/null", &AddDriveOptions::default()).unwrap();
    session.launch().unwrap();
    assert_eq!(reported.load(Ordering::SeqCst), 0);
}

#[test]
fn appliance_root_disk_gets_a_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(Mock {
        appliance_drive: true,
        ..Default::default()
    });
    let mut session = session_with(dir.path(), &mock);
    session.add_drive("/dev/null", &AddDriveOptions::default()).unwrap();

    session.launch().unwrap();
    assert_eq!(session.drives().len(), 2);
    assert!(session.drives().get(1).unwrap().is_dummy());
    assert_eq!(session.debug_drives()[1], "(appliance)");
}

#[test]
fn dropping_the_session_removes_its_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session_with(dir.path(), &Arc::new(Mock::default()));
    session.add_drive("/dev/null", &AddDriveOptions::default()).unwrap();
    session.add_drive_scratch(1 << 20, &AddDriveOptions::default()).unwrap();
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

    drop(session);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

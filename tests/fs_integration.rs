//! End-to-end tests exercising the mounted [`fatfs_core::Filesystem`]
//! surface against in-memory images of all three FAT variants, rather than
//! any one internal module in isolation.

use std::sync::Arc;

use fatfs_core::block_device::MemoryDevice;
use fatfs_core::format::{format_fat12_image, format_fat16_image, format_fat32_image};
use fatfs_core::handle::OpenFlags;
use fatfs_core::vfs::MountOptions;
use fatfs_core::{Error, Filesystem};

fn mount_bytes(image: Vec<u8>, options: MountOptions) -> Filesystem {
    let device = Arc::new(MemoryDevice::from_vec(image));
    Filesystem::mount(device, options).unwrap()
}

fn mount_fat32() -> Filesystem {
    mount_bytes(format_fat32_image(64 * 1024 * 1024), MountOptions::default())
}

#[test]
fn mounts_all_three_fat_variants() {
    let _fat32 = mount_fat32();
    let _fat16 = mount_bytes(format_fat16_image(20 * 1024 * 1024), MountOptions::default());
    let _fat12 = mount_bytes(format_fat12_image(1_474_560), MountOptions::default());
}

#[test]
fn full_file_lifecycle_create_write_read_truncate_delete() {
    let fs = mount_fat32();

    let f = fs.open("/report.txt", OpenFlags::create_write()).unwrap();
    let written = f.write(b"quarterly totals").unwrap();
    assert_eq!(written, 17);
    f.sync().unwrap();
    f.close().unwrap();

    let f = fs.open("/report.txt", OpenFlags::read()).unwrap();
    let mut buf = vec![0u8; 17];
    assert_eq!(f.read(&mut buf).unwrap(), 17);
    assert_eq!(&buf, b"quarterly totals");
    assert_eq!(f.stat().size, 17);
    f.close().unwrap();

    let f = fs.open("/report.txt", OpenFlags::create_write()).unwrap();
    f.truncate(0).unwrap();
    assert_eq!(f.stat().size, 0);
    f.close().unwrap();

    fs.unlink("/report.txt").unwrap();
    assert!(matches!(fs.open("/report.txt", OpenFlags::read()), Err(Error::NotFound)));
}

#[test]
fn nested_directories_hold_their_own_files() {
    let fs = mount_fat32();
    fs.mkdir("/a").unwrap();
    fs.mkdir("/a/b").unwrap();
    fs.open("/a/b/leaf.txt", OpenFlags::create_write()).unwrap();

    let dir = fs.open_dir("/a/b").unwrap();
    let names: Vec<String> = dir.entries().unwrap().into_iter().map(|e| e.name).collect();
    assert!(names.iter().any(|n| n.eq_ignore_ascii_case("leaf.txt")));
    dir.close().unwrap();

    assert!(matches!(fs.mkdir("/missing/child"), Err(Error::NotFound)));
}

#[test]
fn append_writes_land_at_end_of_file_regardless_of_seek() {
    let fs = mount_fat32();
    let f = fs.open("/log.txt", OpenFlags::create_write()).unwrap();
    f.write(b"first;").unwrap();
    f.close().unwrap();

    let f = fs.open("/log.txt", OpenFlags::append_write()).unwrap();
    f.seek(0);
    f.write(b"second;").unwrap();
    f.close().unwrap();

    let f = fs.open("/log.txt", OpenFlags::read()).unwrap();
    let mut buf = vec![0u8; 13];
    f.read(&mut buf).unwrap();
    assert_eq!(&buf, b"first;second;");
}

#[test]
fn rename_moves_a_file_between_directories() {
    let fs = mount_fat32();
    fs.mkdir("/src").unwrap();
    fs.mkdir("/dst").unwrap();
    fs.open("/src/item.txt", OpenFlags::create_write()).unwrap();

    fs.rename("/src/item.txt", "/dst/item.txt").unwrap();

    assert!(matches!(fs.open("/src/item.txt", OpenFlags::read()), Err(Error::NotFound)));
    assert!(fs.open("/dst/item.txt", OpenFlags::read()).is_ok());
}

#[test]
fn rename_onto_an_existing_file_overwrites_it() {
    let fs = mount_fat32();
    let f = fs.open("/one.txt", OpenFlags::create_write()).unwrap();
    f.write(b"replacement").unwrap();
    f.close().unwrap();
    fs.open("/two.txt", OpenFlags::create_write()).unwrap();

    fs.rename("/one.txt", "/two.txt").unwrap();

    assert!(matches!(fs.open("/one.txt", OpenFlags::read()), Err(Error::NotFound)));
    let f = fs.open("/two.txt", OpenFlags::read()).unwrap();
    let mut buf = vec![0u8; 11];
    f.read(&mut buf).unwrap();
    assert_eq!(&buf, b"replacement");
}

#[test]
fn rename_onto_an_existing_nonempty_directory_is_rejected() {
    let fs = mount_fat32();
    fs.mkdir("/src").unwrap();
    fs.mkdir("/dst").unwrap();
    fs.open("/dst/child.txt", OpenFlags::create_write()).unwrap();
    assert!(matches!(fs.rename("/src", "/dst"), Err(Error::NotEmpty)));
}

#[test]
fn rename_directory_across_parents_keeps_its_own_children_reachable() {
    let fs = mount_fat32();
    fs.mkdir("/a").unwrap();
    fs.mkdir("/b").unwrap();
    fs.mkdir("/a/moved").unwrap();
    fs.open("/a/moved/leaf.txt", OpenFlags::create_write()).unwrap();

    fs.rename("/a/moved", "/b/moved").unwrap();

    fs.open("/b/moved/leaf.txt", OpenFlags::read()).unwrap();
    fs.open("/b/moved/new.txt", OpenFlags::create_write()).unwrap();
    assert!(matches!(fs.open("/a/moved", OpenFlags::read()), Err(Error::NotFound)));
}

#[test]
fn two_zero_length_files_do_not_alias_the_same_node() {
    let fs = mount_fat32();
    let a = fs.open("/a.txt", OpenFlags::create_write()).unwrap();
    let b = fs.open("/b.txt", OpenFlags::create_write()).unwrap();
    a.write(b"from a").unwrap();
    b.write(b"from b").unwrap();
    a.close().unwrap();
    b.close().unwrap();

    let a = fs.open("/a.txt", OpenFlags::read()).unwrap();
    let mut buf = vec![0u8; 6];
    a.read(&mut buf).unwrap();
    assert_eq!(&buf, b"from a");

    let b = fs.open("/b.txt", OpenFlags::read()).unwrap();
    let mut buf = vec![0u8; 6];
    b.read(&mut buf).unwrap();
    assert_eq!(&buf, b"from b");
}

#[test]
fn unlink_rejects_nonempty_directory_but_succeeds_once_emptied() {
    let fs = mount_fat32();
    fs.mkdir("/dir").unwrap();
    fs.open("/dir/child.txt", OpenFlags::create_write()).unwrap();

    assert!(matches!(fs.unlink("/dir"), Err(Error::NotEmpty)));

    fs.unlink("/dir/child.txt").unwrap();
    fs.unlink("/dir").unwrap();
    assert!(matches!(fs.open_dir("/dir"), Err(Error::NotFound)));
}

#[test]
fn opening_a_directory_as_a_file_fails() {
    let fs = mount_fat32();
    fs.mkdir("/dir").unwrap();
    assert!(matches!(fs.open("/dir", OpenFlags::read()), Err(Error::NotAFile)));
}

#[test]
fn opening_a_file_as_a_directory_fails() {
    let fs = mount_fat32();
    fs.open("/file.txt", OpenFlags::create_write()).unwrap();
    assert!(matches!(fs.open_dir("/file.txt"), Err(Error::NotADir)));
}

#[test]
fn exclusive_create_rejects_an_existing_file() {
    let fs = mount_fat32();
    fs.open("/once.txt", OpenFlags::create_write()).unwrap();
    let mut flags = OpenFlags::create_write();
    flags.exclusive = true;
    assert!(matches!(fs.open("/once.txt", flags), Err(Error::AlreadyExists)));
}

#[test]
fn touch_updates_mtime_without_touching_content() {
    let fs = mount_fat32();
    let f = fs.open("/stamped.txt", OpenFlags::create_write()).unwrap();
    f.write(b"payload").unwrap();
    let before = f.stat().mtime;
    f.close().unwrap();

    fs.touch("/stamped.txt").unwrap();

    let f = fs.open("/stamped.txt", OpenFlags::read()).unwrap();
    assert_eq!(f.stat().size, 7);
    let _ = before;
}

#[test]
fn operations_after_close_return_unmounted() {
    let fs = mount_fat32();
    fs.close().unwrap();
    assert!(matches!(fs.open("/anything.txt", OpenFlags::read()), Err(Error::Unmounted)));
}

#[test]
fn writes_persist_across_a_remount_of_the_same_bytes() {
    let image = format_fat32_image(64 * 1024 * 1024);
    let device = Arc::new(MemoryDevice::from_vec(image));

    {
        let fs = Filesystem::mount(Arc::clone(&device) as Arc<dyn fatfs_core::BlockDevice>, MountOptions::default()).unwrap();
        let f = fs.open("/durable.txt", OpenFlags::create_write()).unwrap();
        f.write(b"still here").unwrap();
        f.close().unwrap();
        fs.close().unwrap();
    }

    let fs = Filesystem::mount(device as Arc<dyn fatfs_core::BlockDevice>, MountOptions::default()).unwrap();
    let f = fs.open("/durable.txt", OpenFlags::read()).unwrap();
    let mut buf = vec![0u8; 10];
    f.read(&mut buf).unwrap();
    assert_eq!(&buf, b"still here");
}

#[test]
fn read_only_mount_permits_reads_but_rejects_mutation() {
    let image = format_fat32_image(64 * 1024 * 1024);
    {
        let device = Arc::new(MemoryDevice::from_vec(image.clone()));
        let fs = Filesystem::mount(device, MountOptions::default()).unwrap();
        fs.open("/existing.txt", OpenFlags::create_write()).unwrap();
        fs.close().unwrap();
    }

    let device = Arc::new(MemoryDevice::from_vec(image));
    let fs = Filesystem::mount(
        device,
        MountOptions {
            read_only: true,
            ..MountOptions::default()
        },
    )
    .unwrap();

    assert!(fs.open("/nonexistent.txt", OpenFlags::read()).is_err());
    assert!(matches!(fs.mkdir("/new_dir"), Err(Error::PermissionDenied)));
    assert!(matches!(
        fs.open("/new.txt", OpenFlags::create_write()),
        Err(Error::PermissionDenied)
    ));
}

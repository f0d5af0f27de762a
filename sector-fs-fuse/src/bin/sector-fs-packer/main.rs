mod cli;

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::sync::Arc;
use std::sync::Mutex;

use clap::Parser;
use cli::Cli;
use sector_fs::block_cache;
use sector_fs::vfs;
use sector_fs::BlockDevice;
use sector_fs::FreeMap;
use sector_fs::MAX_LENGTH;
use sector_fs::SECTOR_SIZE;
use sector_fs_fuse::BlockFile;
use sector_fs_fuse::FreeList;

const IMAGE_SECTORS: usize = 16 * 2048;

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let device: Arc<dyn BlockDevice> = Arc::new(BlockFile(Mutex::new({
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(cli.out_dir.join("fs.img"))?;
        fd.set_len((IMAGE_SECTORS * SECTOR_SIZE) as u64).unwrap();

        fd
    })));
    // sector 0 stays reserved for whoever formats the volume
    let free_map: Arc<dyn FreeMap> = Arc::new(FreeList::new(1, IMAGE_SECTORS as u32 - 1));

    block_cache::init();
    vfs::init();

    for entry in fs::read_dir(&cli.source)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;
        if data.len() > MAX_LENGTH {
            println!(
                "skipped {:?}: {} bytes exceed the inode capacity",
                path.file_name().unwrap(),
                data.len()
            );
            continue;
        }

        let sector = free_map.allocate(1).expect("image out of sectors")[0];
        assert!(
            vfs::create(sector, 0, &device, &free_map),
            "image out of sectors"
        );
        let inode = vfs::open(sector, &device, &free_map);
        assert_eq!(inode.write_at(0, &data), data.len());
        inode.close();

        println!(
            "packed {:?} -> sector {sector} ({} bytes)",
            path.file_name().unwrap(),
            data.len()
        );
    }

    block_cache::destroy(&device);
    println!(
        "cache: {} hits / {} misses",
        block_cache::hits(),
        block_cache::misses()
    );

    Ok(())
}

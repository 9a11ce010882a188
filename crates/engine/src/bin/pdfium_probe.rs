use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use engine::{FsResolver, PageRenderCoordinator, PdfiumBackend, RenderHandle};
use pdfium_render::prelude::Pdfium;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let mut lib_path: Option<PathBuf> = None;
    let mut dir_path: Option<PathBuf> = None;
    let mut pdf_path: Option<PathBuf> = None;
    let mut out_path: Option<PathBuf> = None;
    let mut page_number: u32 = 1;
    let mut width: u32 = 600;

    let mut args = std::env::args_os().skip(1);
    while let Some(arg) = args.next() {
        let arg_str = arg.to_string_lossy();
        match arg_str.as_ref() {
            "--lib" => {
                let value = args.next().context("missing value for --lib")?;
                lib_path = Some(PathBuf::from(value));
            }
            "--dir" => {
                let value = args.next().context("missing value for --dir")?;
                dir_path = Some(PathBuf::from(value));
            }
            "--pdf" => {
                let value = args.next().context("missing value for --pdf")?;
                pdf_path = Some(PathBuf::from(value));
            }
            "--out" => {
                let value = args.next().context("missing value for --out")?;
                out_path = Some(PathBuf::from(value));
            }
            "--page" => {
                let value = args.next().context("missing value for --page")?;
                let value_str = value.to_string_lossy();
                page_number = value_str
                    .parse::<u32>()
                    .with_context(|| format!("invalid --page value: {value_str}"))?;
                if page_number == 0 {
                    anyhow::bail!("--page must be >= 1");
                }
            }
            "--width" => {
                let value = args.next().context("missing value for --width")?;
                let value_str = value.to_string_lossy();
                width = value_str
                    .parse::<u32>()
                    .with_context(|| format!("invalid --width value: {value_str}"))?;
            }
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            other => anyhow::bail!("unknown arg: {other} (try --help)"),
        }
    }

    if lib_path.is_some() && dir_path.is_some() {
        anyhow::bail!("pass only one of --lib or --dir");
    }
    let lib_path = match (lib_path, dir_path) {
        (Some(path), None) => Some(path),
        (None, Some(dir)) => Some(Pdfium::pdfium_platform_library_name_at_path(&dir)),
        _ => None,
    };

    match &lib_path {
        Some(path) => println!("pdfium: trying {}", path.display()),
        None => println!("pdfium: searching default locations"),
    }
    let backend = Arc::new(PdfiumBackend::new(lib_path));
    backend.check().context("bind pdfium")?;
    println!("pdfium: ok");

    let Some(pdf) = pdf_path else {
        return Ok(());
    };
    let id = FsResolver::id_for_path(&pdf).with_context(|| format!("resolve {}", pdf.display()))?;
    let handle = RenderHandle::acquire(Arc::new(FsResolver::new()), backend, id)
        .await
        .with_context(|| format!("open {}", pdf.display()))?;
    println!("pdf: ok (pages={})", handle.page_count());

    let started = std::time::Instant::now();
    let bitmap = PageRenderCoordinator::new()
        .render_page(Some(&handle), page_number - 1, width)
        .await
        .with_context(|| format!("render page {page_number}"))?;
    println!(
        "render: ok (page={} {}x{} in {:?})",
        page_number,
        bitmap.width,
        bitmap.height,
        started.elapsed()
    );
    handle.close().await;

    if let Some(out) = out_path {
        image::save_buffer(
            &out,
            &bitmap.pixels,
            bitmap.width,
            bitmap.height,
            image::ExtendedColorType::Rgba8,
        )
        .with_context(|| format!("write {}", out.display()))?;
        println!("png: {}", out.display());
    }

    Ok(())
}

fn print_help() {
    println!(
        "\
pdfium_probe

Usage:
  cargo run -p engine --bin pdfium_probe -- --lib <path-to-libpdfium>
  cargo run -p engine --bin pdfium_probe -- --dir <dir-containing-libpdfium> --pdf <file>

Options:
  --lib <path>   Path to shared library (e.g. libpdfium.so/libpdfium.dylib/pdfium.dll)
  --dir <dir>    Directory containing the platform-specific library name
  --pdf <path>   Optional PDF to open and render through the page coordinator
  --page <n>     Page number to render (1-based, default: 1)
  --width <px>   Target width in pixels (default: 600)
  --out <path>   Write the rendered page as PNG
  --help         Show this help

Without --lib or --dir the usual locations and PDFSHELF_PDFIUM_LIB_PATH are searched.
"
    );
}

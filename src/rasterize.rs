//! Turn source documents into one image per page.

use std::num::NonZeroUsize;

use clap::Args;
use tokio::{fs, process::Command};

use crate::{
    async_utils::{check_for_command_failure, is_error_line},
    cpu_limit::with_cpu_semaphore,
    prelude::*,
};

/// Image types we can pass to recognition services as-is.
const SUPPORTED_IMAGE_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/gif",
    "image/tiff",
    "image/bmp",
];

/// Default rasterization resolution.
pub const DEFAULT_DPI: u32 = 300;

/// A rendered page image on disk.
///
/// The image belongs to whoever holds the handle, who must
/// [`discard`](Self::discard) it once it has been recognized.
#[derive(Clone, Debug)]
pub struct PageImage {
    /// The document this page came from.
    pub source: PathBuf,
    /// 0-based page number.
    pub page_idx: usize,
    /// Where the image lives.
    pub path: PathBuf,
    /// The MIME type of the image.
    pub mime_type: String,
}

impl PageImage {
    /// Read the image data.
    pub async fn read(&self) -> Result<Vec<u8>> {
        fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read page image {:?}", self.path.display()))
    }

    /// Delete the image. Failures are logged, not returned, because the
    /// scratch directory holding it is removed later anyway.
    pub async fn discard(self) {
        if let Err(err) = fs::remove_file(&self.path).await {
            warn!(path = %self.path.display(), "Could not delete page image: {err}");
        }
    }
}

/// Options for rasterization.
#[derive(Args, Clone, Debug)]
pub struct RasterizeOpts {
    /// The DPI to use when rendering PDF pages.
    #[clap(long, default_value_t = DEFAULT_DPI)]
    pub dpi: u32,

    /// Only render this many pages of each PDF. Must be at least 1.
    #[clap(long)]
    pub max_pages: Option<NonZeroUsize>,
}

/// Interface to a rasterization engine.
#[async_trait]
pub trait Rasterizer: Send + Sync + 'static {
    /// Render every page of `path` into `output_dir`, in page order. The
    /// caller owns the returned images.
    async fn rasterize(&self, path: &Path, output_dir: &Path, dpi: u32)
    -> Result<Vec<PageImage>>;

    /// Render only page `page_idx` (0-based) of `path` into `output_dir`.
    ///
    /// The default renders everything and keeps the page we want.
    async fn rasterize_page(
        &self,
        path: &Path,
        output_dir: &Path,
        dpi: u32,
        page_idx: usize,
    ) -> Result<PageImage> {
        let mut wanted = None;
        for page in self.rasterize(path, output_dir, dpi).await? {
            if page.page_idx == page_idx {
                wanted = Some(page);
            } else {
                page.discard().await;
            }
        }
        wanted.ok_or_else(|| anyhow!("{:?} has no page {}", path.display(), page_idx))
    }
}

/// Rasterizer built on Poppler's `pdfinfo` and `pdftocairo` tools. Single
/// images are copied through unchanged.
#[derive(Clone, Debug, Default)]
pub struct PopplerRasterizer {
    max_pages: Option<NonZeroUsize>,
}

impl PopplerRasterizer {
    pub fn new(opts: &RasterizeOpts) -> Self {
        Self {
            max_pages: opts.max_pages,
        }
    }

    /// Copy a single image into `output_dir` as page 0, so that discarding
    /// it never touches the source.
    async fn copy_image(
        &self,
        path: &Path,
        output_dir: &Path,
        kind: infer::Type,
    ) -> Result<Vec<PageImage>> {
        let dest = output_dir.join(format!(
            "{}_page1.{}",
            file_stem(path)?,
            kind.extension()
        ));
        fs::copy(path, &dest).await.with_context(|| {
            format!("failed to copy {:?} to {:?}", path.display(), dest.display())
        })?;
        Ok(vec![PageImage {
            source: path.to_owned(),
            page_idx: 0,
            path: dest,
            mime_type: kind.mime_type().to_owned(),
        }])
    }

    /// Render each page of a PDF as a PNG.
    #[instrument(level = "debug", skip_all, fields(path = %path.display(), dpi))]
    async fn render_pdf(
        &self,
        path: &Path,
        output_dir: &Path,
        dpi: u32,
    ) -> Result<Vec<PageImage>> {
        let total_pages = get_pdf_page_count(path).await?;
        if total_pages == 0 {
            return Ok(vec![]);
        }

        let expected = self
            .max_pages
            .map_or(total_pages, |max| total_pages.min(max.get()));

        // pdftocairo appends "-<n>.png" to this, zero-padding `n` to the
        // width of the last page number, so names sort in page order.
        let prefix = format!("{}_page", file_stem(path)?);
        let mut cmd = pdftocairo(dpi);
        if expected < total_pages {
            // Poppler page ranges are 1-based and inclusive.
            cmd.arg("-l").arg(expected.to_string());
        }
        cmd.arg(path).arg(output_dir.join(&prefix));
        run_pdftocairo(path, cmd).await?;

        let mut pages = vec![];
        let mut entries = fs::read_dir(output_dir).await.with_context(|| {
            format!("failed to read output directory {:?}", output_dir.display())
        })?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(".png") {
                pages.push(entry.path());
            }
        }
        pages.sort();

        if pages.len() != expected {
            return Err(anyhow!(
                "pdftocairo produced {} pages for {:?}, expected {}",
                pages.len(),
                path.display(),
                expected,
            ));
        }
        Ok(pages
            .into_iter()
            .enumerate()
            .map(|(page_idx, page_path)| PageImage {
                source: path.to_owned(),
                page_idx,
                path: page_path,
                mime_type: "image/png".to_owned(),
            })
            .collect())
    }

    /// Render a single PDF page as a PNG. `max_pages` does not apply.
    #[instrument(level = "debug", skip_all, fields(path = %path.display(), dpi, page_idx))]
    async fn render_pdf_page(
        &self,
        path: &Path,
        output_dir: &Path,
        dpi: u32,
        page_idx: usize,
    ) -> Result<PageImage> {
        let total_pages = get_pdf_page_count(path).await?;
        if page_idx >= total_pages {
            return Err(anyhow!(
                "{:?} has {} pages, so there is no page {}",
                path.display(),
                total_pages,
                page_idx,
            ));
        }

        // With -singlefile, pdftocairo writes exactly "<prefix>.png".
        let prefix = format!("{}_page{}", file_stem(path)?, page_idx + 1);
        let page_number = (page_idx + 1).to_string();
        let mut cmd = pdftocairo(dpi);
        cmd.arg("-f")
            .arg(&page_number)
            .arg("-l")
            .arg(&page_number)
            .arg("-singlefile")
            .arg(path)
            .arg(output_dir.join(&prefix));
        run_pdftocairo(path, cmd).await?;

        let image = output_dir.join(format!("{prefix}.png"));
        if !fs::try_exists(&image).await.unwrap_or(false) {
            return Err(anyhow!(
                "pdftocairo produced no image for page {} of {:?}",
                page_idx,
                path.display()
            ));
        }
        Ok(PageImage {
            source: path.to_owned(),
            page_idx,
            path: image,
            mime_type: "image/png".to_owned(),
        })
    }
}

/// What kind of source document a path holds.
enum SourceKind {
    Pdf,
    Image(infer::Type),
}

impl SourceKind {
    /// Sniff the type of `path` from its contents.
    fn of(path: &Path) -> Result<Self> {
        let kind = infer::get_from_path(path)
            .with_context(|| format!("failed to read {:?}", path.display()))?
            .ok_or_else(|| anyhow!("unknown file type for {:?}", path.display()))?;
        if kind.mime_type() == "application/pdf" {
            Ok(Self::Pdf)
        } else if SUPPORTED_IMAGE_TYPES.contains(&kind.mime_type()) {
            Ok(Self::Image(kind))
        } else {
            Err(anyhow!(
                "unsupported MIME type {} for {:?} (supported: PDF, PNG, JPEG, WebP, GIF, TIFF, BMP)",
                kind.mime_type(),
                path.display()
            ))
        }
    }
}

#[async_trait]
impl Rasterizer for PopplerRasterizer {
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn rasterize(
        &self,
        path: &Path,
        output_dir: &Path,
        dpi: u32,
    ) -> Result<Vec<PageImage>> {
        let pages = match SourceKind::of(path)? {
            SourceKind::Pdf => self.render_pdf(path, output_dir, dpi).await?,
            SourceKind::Image(kind) => self.copy_image(path, output_dir, kind).await?,
        };
        debug!(pages = pages.len(), "Rasterized document");
        Ok(pages)
    }

    #[instrument(level = "debug", skip_all, fields(path = %path.display(), page_idx))]
    async fn rasterize_page(
        &self,
        path: &Path,
        output_dir: &Path,
        dpi: u32,
        page_idx: usize,
    ) -> Result<PageImage> {
        match SourceKind::of(path)? {
            SourceKind::Pdf => self.render_pdf_page(path, output_dir, dpi, page_idx).await,
            SourceKind::Image(kind) if page_idx == 0 => {
                let mut pages = self.copy_image(path, output_dir, kind).await?;
                pages
                    .pop()
                    .ok_or_else(|| anyhow!("no image copied for {:?}", path.display()))
            }
            SourceKind::Image(_) => Err(anyhow!(
                "{:?} is a single image, so there is no page {}",
                path.display(),
                page_idx
            )),
        }
    }
}

/// Start a `pdftocairo` command rendering PNGs at `dpi`.
fn pdftocairo(dpi: u32) -> Command {
    let mut cmd = Command::new("pdftocairo");
    // If our caller gives up on us (timeout, cancellation), stop rendering.
    cmd.kill_on_drop(true);
    cmd.arg("-png").arg("-r").arg(dpi.to_string());
    cmd
}

/// Run a `pdftocairo` command for `path` and check that it succeeded.
async fn run_pdftocairo(path: &Path, mut cmd: Command) -> Result<()> {
    // pdftocairo uses at least a full core, so don't run hundreds at once.
    let output = with_cpu_semaphore(|| async {
        cmd.output()
            .await
            .with_context(|| format!("failed to run pdftocairo on {:?}", path.display()))
    })
    .await?;
    check_for_command_failure("pdftocairo", &output, Some(&is_error_line))
}

/// Get a file name without its extension, for naming page images.
fn file_stem(path: &Path) -> Result<String> {
    Ok(path
        .file_stem()
        .with_context(|| format!("no file name in {:?}", path.display()))?
        .to_string_lossy()
        .trim()
        .to_owned())
}

/// Ask `pdfinfo` how many pages a PDF has.
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    let pages = output
        .lines()
        .find_map(|line| line.strip_prefix("Pages:"))
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    pages.trim().parse::<usize>().with_context(|| {
        format!("failed to parse page count for {:?} from pdfinfo output", path.display())
    })
}

//! Request path resolution for quire.
//!
//! Maps a request URI and locale onto a file beneath one of the configured roots, refusing
//! anything that could escape those roots or expose files that are not meant to be public.
//! Symbolic links, traversal components, non-regular files and, for public documents, files
//! that are not world-readable all resolve to `Missing`.

mod open;
mod path;
mod printers;
mod resolver;
mod roots;

pub use self::{
    path::{locale_variants, Root, RootedPath},
    printers::{NoPrinters, PrinterDirectory, PrinterEntry, StaticPrinters},
    resolver::{gateway_prefix, Classified, FoundFile, ResolvedFile, Resolver, GATEWAY_PREFIXES},
    roots::Roots,
};

#[cfg(test)]
mod helpers;

#[cfg(test)]
mod backend;
#[cfg(test)]
mod codec;
#[cfg(test)]
mod pipeline;
#[cfg(test)]
mod pool;

fn main() {}

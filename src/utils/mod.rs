pub mod bimap;
